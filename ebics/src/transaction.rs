//! State of segmented upload and download transactions.

use zeroize::Zeroizing;

use crate::error::{EbicsError, ProtocolContext, Result};
use crate::request::TransactionPhase;

/// Largest raw segment whose base64 form stays within the 1 MiB EBICS limit.
pub const DEFAULT_SEGMENT_SIZE: usize = 786_432;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 1-based.
    pub number: u32,
    pub last: bool,
    pub data: Vec<u8>,
}

/// Splits `data` into `ceil(len / size)` segments; exactly the final one is flagged last.
pub fn segment(data: &[u8], size: usize) -> Result<Vec<Segment>> {
    if size == 0 {
        return Err(EbicsError::InvalidState("segment size must not be zero".into()));
    }
    let total = data.chunks(size).count();
    data.chunks(size)
        .enumerate()
        .map(|(index, chunk)| {
            let number = u32::try_from(index + 1)
                .map_err(|_| EbicsError::InvalidState("too many segments".into()))?;
            Ok(Segment {
                number,
                last: index + 1 == total,
                data: chunk.to_vec(),
            })
        })
        .collect()
}

fn context(order_type: &str, id: Option<&str>) -> ProtocolContext {
    ProtocolContext {
        order_type: Some(order_type.to_string()),
        transaction_id: id.map(str::to_string),
        return_code: None,
    }
}

/// An outgoing payload, encrypted and cut into segments before initialisation.
#[derive(Debug, Clone)]
pub struct UploadTransaction {
    order_type: String,
    id: Option<String>,
    order_id: Option<String>,
    phase: TransactionPhase,
    segments: Vec<Segment>,
    key: Zeroizing<Vec<u8>>,
}

impl UploadTransaction {
    pub fn new(order_type: impl Into<String>, encrypted: &[u8], key: &[u8], segment_size: usize) -> Result<Self> {
        let order_type = order_type.into();
        let segments = segment(encrypted, segment_size)?;
        if segments.is_empty() {
            return Err(EbicsError::protocol("upload has no data", context(&order_type, None)));
        }
        Ok(UploadTransaction {
            order_type,
            id: None,
            order_id: None,
            phase: TransactionPhase::Initialisation,
            segments,
            key: Zeroizing::new(key.to_vec()),
        })
    }

    pub fn order_type(&self) -> &str {
        &self.order_type
    }

    /// Bank-assigned transaction id, known after initialisation.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn num_segments(&self) -> u32 {
        self.segments.last().map_or(0, |s| s.number)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Records the initialisation response and moves on to Transfer.
    pub fn initialized(&mut self, id: Option<&str>, order_id: Option<&str>) -> Result<()> {
        let id = id.ok_or_else(|| {
            EbicsError::protocol(
                "initialisation response carries no transaction id",
                context(&self.order_type, None),
            )
        })?;
        self.id = Some(id.to_string());
        if let Some(order_id) = order_id {
            self.order_id = Some(order_id.to_string());
        }
        self.phase = TransactionPhase::Transfer;
        Ok(())
    }

    /// Checks that a response still belongs to this transaction.
    pub fn check_id(&self, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) if Some(id) != self.id.as_deref() => Err(EbicsError::protocol(
                format!("response belongs to transaction {}", id),
                context(&self.order_type, self.id.as_deref()),
            )),
            _ => Ok(()),
        }
    }

    pub fn finish(&mut self) {
        self.phase = TransactionPhase::Receipt;
    }
}

/// Collects the segments of a download; nothing is decrypted before the last one arrived.
#[derive(Debug)]
pub struct DownloadTransaction {
    order_type: String,
    id: String,
    phase: TransactionPhase,
    num_segments: u32,
    segments: Vec<Vec<u8>>,
    complete: bool,
    wrapped_key: Vec<u8>,
}

impl DownloadTransaction {
    pub fn new(order_type: impl Into<String>, id: impl Into<String>, num_segments: u32, wrapped_key: Vec<u8>) -> Result<Self> {
        let order_type = order_type.into();
        let id = id.into();
        if num_segments == 0 {
            return Err(EbicsError::protocol(
                "download announces no segments",
                context(&order_type, Some(&id)),
            ));
        }
        Ok(DownloadTransaction {
            order_type,
            id,
            phase: TransactionPhase::Initialisation,
            num_segments,
            segments: Vec::with_capacity(num_segments as usize),
            complete: false,
            wrapped_key,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn received(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Number of the segment to ask for next, if any.
    pub fn next_segment(&self) -> Option<u32> {
        if self.complete {
            None
        } else {
            Some(self.received() + 1)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    fn fail(&self, message: String) -> EbicsError {
        EbicsError::protocol(message, context(&self.order_type, Some(&self.id)))
    }

    /// Adds segment `number`; segments must arrive in order, the last one flagged.
    pub fn receive(&mut self, number: u32, last: bool, data: Vec<u8>) -> Result<()> {
        if self.complete {
            return Err(self.fail(format!("segment {} after the last segment", number)));
        }
        let expected = self.received() + 1;
        if number != expected {
            return Err(self.fail(format!("expected segment {}, got {}", expected, number)));
        }
        if number > self.num_segments {
            return Err(self.fail(format!(
                "segment {} exceeds the announced {} segments",
                number, self.num_segments
            )));
        }
        if last != (number == self.num_segments) {
            return Err(self.fail(format!(
                "segment {} of {} flagged lastSegment={}",
                number, self.num_segments, last
            )));
        }
        log::debug!("{} transaction {}: segment {}/{}", self.order_type, self.id, number, self.num_segments);
        self.segments.push(data);
        self.complete = last;
        self.phase = if last {
            TransactionPhase::Receipt
        } else {
            TransactionPhase::Transfer
        };
        Ok(())
    }

    /// The concatenated encrypted order data.
    pub fn finalize(&self) -> Result<Vec<u8>> {
        if !self.complete {
            return Err(self.fail(format!(
                "cannot decrypt before the last segment, {} of {} received",
                self.received(),
                self.num_segments
            )));
        }
        Ok(self.segments.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_counts_and_reassembly() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        for (len, size) in [(1usize, 1usize), (1000, 1), (1000, 7), (1000, 1000), (1000, 1001), (999, 333), (1000, 333)] {
            let data = &data[..len];
            let segments = segment(data, size).unwrap();
            assert_eq!(segments.len(), (len + size - 1) / size);
            assert_eq!(segments.iter().filter(|s| s.last).count(), 1);
            assert!(segments.last().unwrap().last);
            let numbers: Vec<u32> = segments.iter().map(|s| s.number).collect();
            assert_eq!(numbers, (1..=segments.len() as u32).collect::<Vec<_>>());
            let joined: Vec<u8> = segments.iter().flat_map(|s| s.data.clone()).collect();
            assert_eq!(joined, data);
        }
        assert!(segment(&[], 10).unwrap().is_empty());
        assert!(segment(b"abc", 0).is_err());
    }

    #[test]
    fn test_upload_transaction_lifecycle() {
        let mut tx = UploadTransaction::new("FUL", &[0u8; 40], &[1u8; 16], 16).unwrap();
        assert_eq!(tx.num_segments(), 3);
        assert_eq!(tx.phase(), TransactionPhase::Initialisation);
        assert!(tx.initialized(None, None).is_err());
        tx.initialized(Some("T1"), Some("A001")).unwrap();
        assert_eq!(tx.id(), Some("T1"));
        assert_eq!(tx.phase(), TransactionPhase::Transfer);
        assert!(tx.check_id(Some("T1")).is_ok());
        assert!(tx.check_id(None).is_ok());
        assert!(tx.check_id(Some("T2")).is_err());
        assert!(UploadTransaction::new("FUL", &[], &[1u8; 16], 16).is_err());
    }

    #[test]
    fn test_download_refuses_to_finalize_early() {
        let mut tx = DownloadTransaction::new("STA", "T1", 3, vec![9]).unwrap();
        tx.receive(1, false, b"aa".to_vec()).unwrap();
        assert!(matches!(tx.finalize(), Err(EbicsError::Protocol { .. })));
        assert!(tx.receive(3, true, b"cc".to_vec()).is_err());
        tx.receive(2, false, b"bb".to_vec()).unwrap();
        assert!(tx.finalize().is_err());
        assert_eq!(tx.next_segment(), Some(3));
        tx.receive(3, true, b"cc".to_vec()).unwrap();
        assert_eq!(tx.finalize().unwrap(), b"aabbcc");
        assert_eq!(tx.next_segment(), None);
        assert_eq!(tx.phase(), TransactionPhase::Receipt);
        assert!(tx.receive(4, true, vec![]).is_err());
    }

    #[test]
    fn last_flag_must_match_segment_count() {
        let mut tx = DownloadTransaction::new("STA", "T1", 2, vec![]).unwrap();
        assert!(tx.receive(1, true, vec![]).is_err());
        tx.receive(1, false, vec![]).unwrap();
        assert!(tx.receive(2, false, vec![]).is_err());
        assert!(DownloadTransaction::new("STA", "T1", 0, vec![]).is_err());
    }
}
