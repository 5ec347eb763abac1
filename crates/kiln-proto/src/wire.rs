//! Packed little-endian payload structs.
//!
//! Each subject with a non-empty payload has a struct here with `encode` and
//! `decode`. Arrays occupy the rest of the buffer; there are no length
//! prefixes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

fn check_len(what: &'static str, expected: usize, buf: &[u8]) -> Result<(), WireError> {
    if buf.len() < expected {
        return Err(WireError::Short {
            what,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Worker/agent announcement: proposed heartbeat timeout and the inclusive
/// range of job types it can evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub hb_timeout_secs: u32,
    pub job_type_lo: u32,
    pub job_type_hi: u32,
}

impl Hello {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32_le(self.hb_timeout_secs);
        buf.put_u32_le(self.job_type_lo);
        buf.put_u32_le(self.job_type_hi);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        check_len("Hello", 12, buf)?;
        Ok(Hello {
            hb_timeout_secs: buf.get_u32_le(),
            job_type_lo: buf.get_u32_le(),
            job_type_hi: buf.get_u32_le(),
        })
    }
}

/// Reply to [`Hello`], carrying the timeout both sides will honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Welcome {
    pub hb_timeout_secs: u32,
}

impl Welcome {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(self.hb_timeout_secs);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        check_len("Welcome", 4, buf)?;
        Ok(Welcome {
            hb_timeout_secs: buf.get_u32_le(),
        })
    }
}

/// One component evaluation: job id, job type, and the sample narrowed to f32.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: u32,
    pub job_type: u32,
    pub data: Vec<f32>,
}

impl Job {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.data.len() * 4);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.job_type);
        for v in &self.data {
            buf.put_f32_le(*v);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        check_len("Job", 8, buf)?;
        let id = buf.get_u32_le();
        let job_type = buf.get_u32_le();
        if buf.len() % 4 != 0 {
            return Err(WireError::RaggedArray {
                what: "Job",
                elem: 4,
            });
        }
        let mut data = Vec::with_capacity(buf.len() / 4);
        while buf.has_remaining() {
            data.push(buf.get_f32_le());
        }
        Ok(Job { id, job_type, data })
    }
}

/// A worker's scalar answer to one job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobResult {
    pub id: u32,
    pub data: f32,
}

impl JobResult {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32_le(self.id);
        buf.put_f32_le(self.data);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        check_len("Result", 8, buf)?;
        Ok(JobResult {
            id: buf.get_u32_le(),
            data: buf.get_f32_le(),
        })
    }
}

/// A sample vector submitted by the requester for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchJob {
    pub id: u32,
    pub data: Vec<f64>,
}

impl BatchJob {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.data.len() * 8);
        buf.put_u32_le(self.id);
        for v in &self.data {
            buf.put_f64_le(*v);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        check_len("BatchJob", 4, buf)?;
        let id = buf.get_u32_le();
        if buf.len() % 8 != 0 {
            return Err(WireError::RaggedArray {
                what: "BatchJob",
                elem: 8,
            });
        }
        let mut data = Vec::with_capacity(buf.len() / 8);
        while buf.has_remaining() {
            data.push(buf.get_f64_le());
        }
        Ok(BatchJob { id, data })
    }
}

/// The assembled per-job-type components of a batch, slot `i` holding the
/// result of job type `i + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub id: u32,
    pub data: Vec<f64>,
}

impl BatchResult {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.data.len() * 8);
        buf.put_u32_le(self.id);
        for v in &self.data {
            buf.put_f64_le(*v);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        check_len("BatchResult", 4, buf)?;
        let id = buf.get_u32_le();
        if buf.len() % 8 != 0 {
            return Err(WireError::RaggedArray {
                what: "BatchResult",
                elem: 8,
            });
        }
        let mut data = Vec::with_capacity(buf.len() / 8);
        while buf.has_remaining() {
            data.push(buf.get_f64_le());
        }
        Ok(BatchResult { id, data })
    }
}
