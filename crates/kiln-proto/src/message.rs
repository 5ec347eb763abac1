//! The fabric message envelope.

use bytes::{Bytes, BytesMut};

use crate::{Subject, WireError};

/// Address + subject + payload. The address is an opaque routing identity and
/// is empty on point-to-point links (DEALER/REQ/REP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub address: Bytes,
    pub subject: Subject,
    pub payload: Bytes,
}

impl Message {
    pub fn new(address: impl Into<Bytes>, subject: Subject, payload: impl Into<Bytes>) -> Self {
        Message {
            address: address.into(),
            subject,
            payload: payload.into(),
        }
    }

    /// A message with no routing address, for connected (non-ROUTER) sockets.
    pub fn direct(subject: Subject, payload: impl Into<Bytes>) -> Self {
        Message::new(Bytes::new(), subject, payload)
    }

    pub fn heartbeat(address: impl Into<Bytes>) -> Self {
        Message::new(address, Subject::Heartbeat, Bytes::new())
    }

    pub fn bye(address: impl Into<Bytes>) -> Self {
        Message::new(address, Subject::Bye, Bytes::new())
    }

    /// Serialize into transport frames: `[address?], subject || payload`.
    pub fn to_frames(&self) -> Vec<Bytes> {
        let mut body = BytesMut::with_capacity(1 + self.payload.len());
        body.extend_from_slice(&[self.subject.to_u8()]);
        body.extend_from_slice(&self.payload);

        let mut frames = Vec::with_capacity(2);
        if !self.address.is_empty() {
            frames.push(self.address.clone());
        }
        frames.push(body.freeze());
        frames
    }

    /// Parse transport frames. `routed` is true for ROUTER sockets, whose
    /// first frame is the sender identity.
    pub fn from_frames(frames: &[Bytes], routed: bool) -> Result<Self, WireError> {
        let (address, body) = if routed {
            if frames.len() < 2 {
                return Err(WireError::MissingBody);
            }
            (frames[0].clone(), &frames[1])
        } else {
            let body = frames.first().ok_or(WireError::MissingBody)?;
            (Bytes::new(), body)
        };

        if body.is_empty() {
            return Err(WireError::EmptyBody);
        }
        let subject = Subject::from_u8(body[0])?;
        Ok(Message {
            address,
            subject,
            payload: body.slice(1..),
        })
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} byte payload)",
            self.subject,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use pretty_assertions::assert_eq;

    #[test]
    fn direct_roundtrip() {
        let msg = Message::direct(
            Subject::BatchJob,
            wire::BatchJob {
                id: 9,
                data: vec![0.5],
            }
            .encode(),
        );
        let frames = msg.to_frames();
        assert_eq!(frames.len(), 1);

        let parsed = Message::from_frames(&frames, false).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.address.is_empty());
    }

    #[test]
    fn routed_roundtrip_preserves_identity() {
        let msg = Message::new(
            Bytes::from_static(b"worker-1"),
            Subject::Job,
            wire::Job {
                id: 1,
                job_type: 2,
                data: vec![1.0],
            }
            .encode(),
        );
        let frames = msg.to_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), b"worker-1");

        let parsed = Message::from_frames(&frames, true).unwrap();
        assert_eq!(parsed.address.as_ref(), b"worker-1");
        assert_eq!(parsed.subject, Subject::Job);
    }

    #[test]
    fn empty_payload_subjects() {
        let hb = Message::heartbeat(Bytes::new());
        let parsed = Message::from_frames(&hb.to_frames(), false).unwrap();
        assert_eq!(parsed.subject, Subject::Heartbeat);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn decoded_subject_matches_sent() {
        for subject in [
            Subject::Heartbeat,
            Subject::Hello,
            Subject::Bye,
            Subject::Job,
            Subject::Result,
            Subject::BatchJob,
            Subject::BatchResult,
            Subject::Welcome,
        ] {
            let msg = Message::direct(subject, Bytes::new());
            let parsed = Message::from_frames(&msg.to_frames(), false).unwrap();
            assert_eq!(parsed.subject, subject);
        }
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            Message::from_frames(&[], false),
            Err(WireError::MissingBody)
        ));
        assert!(matches!(
            Message::from_frames(&[Bytes::new()], false),
            Err(WireError::EmptyBody)
        ));
        assert!(matches!(
            Message::from_frames(&[Bytes::from_static(b"id")], true),
            Err(WireError::MissingBody)
        ));
        assert!(matches!(
            Message::from_frames(&[Bytes::from_static(&[0x09])], false),
            Err(WireError::UnknownSubject(0x09))
        ));
    }
}
