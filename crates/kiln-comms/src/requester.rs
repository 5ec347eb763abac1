//! The requester: the sampler's handle onto the fabric.
//!
//! Submit any number of batches, then retrieve results as batches complete.
//! Completion order is not submission order.

use kiln_proto::{wire, Message, Subject};
use tracing::info;
use zeromq::{DealerSocket, Socket};

use crate::channel::Channel;
use crate::CommsError;

pub struct Requester {
    channel: Channel<DealerSocket>,
}

impl Requester {
    /// Connect to the delegator's front socket.
    pub async fn connect(addr: &str) -> Result<Self, CommsError> {
        let mut socket = DealerSocket::new();
        info!(addr, "requester connecting to delegator");
        socket.connect(addr).await?;
        Ok(Requester {
            channel: Channel::direct("toDelegator", socket),
        })
    }

    /// Submit a batch for evaluation.
    pub async fn submit(&mut self, id: u32, data: &[f64]) -> Result<(), CommsError> {
        let batch = wire::BatchJob {
            id,
            data: data.to_vec(),
        };
        self.channel
            .send(&Message::direct(Subject::BatchJob, batch.encode()))
            .await;
        Ok(())
    }

    /// Block until some batch completes; returns its id and the per-job-type
    /// result components.
    pub async fn retrieve(&mut self) -> Result<(u32, Vec<f64>), CommsError> {
        loop {
            let msg = self.channel.recv().await?;
            match msg.subject {
                Subject::BatchResult => {
                    let result = wire::BatchResult::decode(&msg.payload)?;
                    return Ok((result.id, result.data));
                }
                // Nothing else is expected on this link; drop and keep waiting.
                other => {
                    tracing::debug!(subject = %other, "ignoring non-result on requester link");
                }
            }
        }
    }
}
