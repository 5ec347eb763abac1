//! Message subject tags.

use crate::WireError;

/// Subject of a fabric message, carried as the first byte of the body frame.
///
/// The numeric values are the wire encoding; changing them is a protocol
/// break.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Liveness probe, empty payload.
    Heartbeat = 0,
    /// Worker or agent announces itself and its supported job types.
    Hello = 1,
    /// Graceful disconnect, empty payload.
    Bye = 2,
    /// One component evaluation dispatched to a worker.
    Job = 3,
    /// A worker's answer to a single job.
    Result = 4,
    /// A full sample vector submitted for evaluation.
    BatchJob = 5,
    /// The assembled per-job-type components of a batch.
    BatchResult = 6,
    /// Reply to Hello carrying the negotiated heartbeat timeout.
    Welcome = 7,
}

impl Subject {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Subject::Heartbeat),
            1 => Ok(Subject::Hello),
            2 => Ok(Subject::Bye),
            3 => Ok(Subject::Job),
            4 => Ok(Subject::Result),
            5 => Ok(Subject::BatchJob),
            6 => Ok(Subject::BatchResult),
            7 => Ok(Subject::Welcome),
            other => Err(WireError::UnknownSubject(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Heartbeat => "HEARTBEAT",
            Subject::Hello => "HELLO",
            Subject::Bye => "BYE",
            Subject::Job => "JOB",
            Subject::Result => "RESULT",
            Subject::BatchJob => "BATCH_JOB",
            Subject::BatchResult => "BATCH_RESULT",
            Subject::Welcome => "WELCOME",
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
