use crate::registry::JobHandle;
use crate::supervisor::EncoderSupervisor;
use crate::{JobId, JobStatus};
use async_channel::Receiver;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(JobId),
    JobFinished(JobId, JobStatus),
}

pub async fn start(
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Arc<JobHandle>>,
    supervisor: EncoderSupervisor,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                match job {
                    Err(err) => {
                        debug!(message = "Job queue closed, exiting", error = ?err);
                        break;
                    },
                    Ok(handle) => {
                        if !handle.begin() {
                            debug!(job_id = %handle.id(), "Skipping job cancelled while queued");
                            continue;
                        }
                        notify(&send_to_server, WorkMessage::JobStarted(handle.id()));
                        let outcome = supervisor.run(&handle).await;
                        notify(&send_to_server, WorkMessage::JobFinished(handle.id(), outcome.status()));
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

fn notify(send_to_server: &UnboundedSender<WorkMessage>, message: WorkMessage) {
    // The server going away only costs us the notification.
    if let Err(err) = send_to_server.send(message) {
        warn!(message = "Failed to notify server", error = ?err);
    }
}
