use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use ebics::{
    Acknowledge, ClientConfig, CryptService, DownloadOrder, EbicsClient, FixtureTransport, HttpTransport, Keyring,
    KeyringManager, OrderResult, Service, SignatureType, Transport, UploadOrder,
};

/// EBICS client: key management, downloads and uploads against an EBICS bank server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Connection settings (JSON).
    #[arg(long, default_value = "ebics.json")]
    config: PathBuf,

    /// Keyring file (JSON), written back after key changes.
    #[arg(long, default_value = "keyring.json")]
    keyring: PathBuf,

    /// Keyring password.
    #[arg(long, env = "EBICS_PASSWORD", hide_env_values = true, default_value = "")]
    password: String,

    /// Serve responses from a directory of `ORDER[_FORMAT]_phase[_n].xml` files instead of the bank.
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Print the help as markdown and exit.
    #[arg(long, hide = true)]
    markdown_help: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the user keys and optionally attach certificates (PEM files).
    Init {
        #[arg(long)]
        cert_a: Option<PathBuf>,
        #[arg(long)]
        cert_x: Option<PathBuf>,
        #[arg(long)]
        cert_e: Option<PathBuf>,
    },
    /// List the protocol versions the bank supports.
    Hev,
    /// Send the signature key (INI).
    Ini,
    /// Send the authentication and encryption keys (HIA).
    Hia,
    /// Fetch the bank keys (HPB).
    Hpb,
    /// Print the INI and HIA letters.
    Letters {
        /// Write to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Download an order (STA, C53, FDL, BTD, ...).
    Download {
        order_type: String,
        /// FDL file format.
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        country: Option<String>,
        /// BTD service name, e.g. EOP.
        #[arg(long)]
        service: Option<String>,
        /// BTD message name, e.g. camt.053.
        #[arg(long)]
        message: Option<String>,
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
        /// Directory the downloaded files are written to.
        #[arg(long, default_value = ".")]
        out: PathBuf,
        /// Answer with a negative receipt.
        #[arg(long)]
        reject: bool,
    },
    /// Upload a file (CCT, CDD, XE2, FUL, BTU).
    Upload {
        order_type: String,
        file: PathBuf,
        /// FUL file format.
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        country: Option<String>,
        /// BTU service name, e.g. SCT.
        #[arg(long)]
        service: Option<String>,
        /// BTU message name, e.g. pain.001.
        #[arg(long)]
        message: Option<String>,
    },
    /// Keyring maintenance.
    Keyring {
        #[command(subcommand)]
        action: KeyringAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeyringAction {
    /// Check that the password unlocks every private key.
    Check,
    /// Rewrap every private key under a new password.
    ChangePassword {
        #[arg(long, env = "EBICS_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.markdown_help {
        clap_markdown::print_help_markdown::<Args>();
        return Ok(());
    }
    let Some(command) = args.command.as_ref() else {
        bail!("no command given, see --help");
    };

    let config = ClientConfig::load(&args.config)
        .with_context(|| format!("failed to read config {}", args.config.display()))?;
    match &args.fixtures {
        Some(dir) => {
            let transport = FixtureTransport::from_dir(dir)
                .with_context(|| format!("failed to load fixtures from {}", dir.display()))?;
            run(&args, command, config, transport)
        }
        None => {
            let transport = HttpTransport::new(config.timeout())?;
            run(&args, command, config, transport)
        }
    }
}

fn read_certificate(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let pem = pem::parse(text).with_context(|| format!("{} is not a PEM certificate", path.display()))?;
    Ok(pem.contents().to_vec())
}

fn service(name: &Option<String>, message: &Option<String>) -> Result<Option<Service>> {
    match (name, message) {
        (Some(name), Some(message)) => Ok(Some(Service::new(name.as_str(), message.as_str()))),
        (None, None) => Ok(None),
        _ => bail!("--service and --message go together"),
    }
}

fn run<T: Transport>(args: &Args, command: &Command, config: ClientConfig, transport: T) -> Result<()> {
    let locator = Arc::new(config.storage_locator());
    let manager = KeyringManager::new(Arc::clone(&locator));
    let keyring = if args.keyring.exists() {
        manager
            .load(&args.keyring, &args.password)
            .with_context(|| format!("failed to read keyring {}", args.keyring.display()))?
    } else {
        log::info!("{} does not exist, starting with an empty keyring", args.keyring.display());
        Keyring::new(config.version, args.password.as_str())
    };
    let mut client = EbicsClient::new(config, keyring, CryptService::new(locator), transport)?;

    let mut keyring_changed = false;
    match command {
        Command::Init { cert_a, cert_x, cert_e } => {
            if !client.keyring().has_user_keys() {
                client.create_user_signatures()?;
                keyring_changed = true;
            }
            for (signature_type, path) in [
                (SignatureType::A, cert_a),
                (SignatureType::X, cert_x),
                (SignatureType::E, cert_e),
            ] {
                if let Some(path) = path {
                    client.set_user_certificate(signature_type, read_certificate(path)?)?;
                    keyring_changed = true;
                }
            }
        }
        Command::Hev => {
            for version in client.hev()? {
                println!("{} {}", version.protocol, version.version);
            }
        }
        Command::Ini => {
            client.ini()?;
        }
        Command::Hia => {
            client.hia()?;
        }
        Command::Hpb => {
            client.hpb()?;
            keyring_changed = true;
        }
        Command::Letters { out } => {
            let text = client.letters()?.to_text();
            match out {
                Some(path) => fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?,
                None => print!("{}", text),
            }
        }
        Command::Download {
            order_type,
            format,
            country,
            service: name,
            message,
            start,
            end,
            out,
            reject,
        } => {
            let mut order = match (format, service(name, message)?) {
                (Some(format), _) => DownloadOrder::fdl(format.as_str(), country.clone()),
                (None, Some(service)) => DownloadOrder::btd(service),
                (None, None) => DownloadOrder::new(order_type)?,
            };
            if let (Some(start), Some(end)) = (start, end) {
                order = order.with_date_range(*start, *end);
            }
            let acknowledge: Option<Acknowledge> = reject.then(|| Arc::new(|_: &[u8]| false) as Acknowledge);
            if let OrderResult::Download { files, .. } = client.download(&mut order, acknowledge)? {
                fs::create_dir_all(out)?;
                for (i, file) in files.iter().enumerate() {
                    let name = file.name.clone().unwrap_or_else(|| format!("{}_{}.dat", order_type, i + 1));
                    let path = out.join(name);
                    fs::write(&path, &file.data).with_context(|| format!("failed to write {}", path.display()))?;
                    println!("{}", path.display());
                }
            }
        }
        Command::Upload {
            order_type,
            file,
            format,
            country,
            service: name,
            message,
        } => {
            let payload = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
            let mut order = match (format, service(name, message)?) {
                (Some(format), _) => UploadOrder::ful(format.as_str(), country.clone(), payload),
                (None, Some(service)) => UploadOrder::btu(service, payload),
                (None, None) => UploadOrder::new(order_type, payload)?,
            };
            if let OrderResult::Upload { transaction, .. } = client.upload(&mut order)? {
                println!(
                    "transaction {} order {}",
                    transaction.id().unwrap_or("-"),
                    transaction.order_id().unwrap_or("-")
                );
            }
        }
        Command::Keyring { action } => match action {
            KeyringAction::Check => {
                if !client.keyring().check(client.crypt().locator()) {
                    bail!("the password does not unlock every private key");
                }
                println!("keyring ok");
            }
            KeyringAction::ChangePassword { new_password } => {
                let locator = client.crypt().shared_locator();
                client.keyring_mut().change_password(&locator, new_password)?;
                keyring_changed = true;
            }
        },
    }

    if keyring_changed {
        manager
            .save(client.keyring(), &args.keyring)
            .with_context(|| format!("failed to write keyring {}", args.keyring.display()))?;
        log::info!("keyring saved to {}", args.keyring.display());
    }
    Ok(())
}
