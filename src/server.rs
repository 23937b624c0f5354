use crate::config::Config;
use crate::db::{DbHandle, MemoryStats, StatsStore};
use crate::probe::Ffprobe;
use crate::process::TokioLauncher;
use crate::progress::SidecarPoller;
use crate::registry::JobRegistry;
use crate::reporter::{ProgressReporter, Renderer};
use crate::service::Service;
use crate::session::{MediaSource, SessionStore};
use crate::supervisor::EncoderSupervisor;
use crate::view::View;
use crate::worker::{self, WorkMessage};
use crate::{JobId, JobStatus, UserId};
use anyhow::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug)]
pub enum Request {
    /// Media already stored under the work directory.
    Media { user_id: UserId, media: MediaSource },
    /// A button press.
    Action { user_id: UserId, token: String },
    Cancel { user_id: UserId },
    Stats { user_id: UserId },
}

impl Request {
    pub fn user_id(&self) -> UserId {
        match self {
            Request::Media { user_id, .. }
            | Request::Action { user_id, .. }
            | Request::Cancel { user_id }
            | Request::Stats { user_id } => *user_id,
        }
    }
}

#[derive(Debug)]
pub enum Response {
    View { user_id: UserId, view: View },
    Rejected { user_id: UserId, error: String },
    JobStarted(JobId),
    JobFinished(JobId, JobStatus),
}

pub async fn serve(
    cancel_token: CancellationToken,
    config: Config,
    renderer: Arc<dyn Renderer>,
    mut recv_from_client: mpsc::UnboundedReceiver<Request>,
    send_to_client: mpsc::UnboundedSender<Response>,
) -> Result<(), Error> {
    tokio::fs::create_dir_all(&config.work_dir).await?;

    let stats: Arc<dyn StatsStore> = match &config.connect_url {
        Some(url) => {
            trace!("Connecting to db");
            Arc::new(DbHandle::new(url).await?)
        }
        None => Arc::new(MemoryStats::default()),
    };

    let (registry, recv_from_queue) = JobRegistry::new(&config.work_dir, config.queue_size);
    let registry = Arc::new(registry);
    let service = Arc::new(Service::new(
        SessionStore::new(config.session_limits()),
        registry.clone(),
        Arc::new(Ffprobe::new(&config.ffprobe)),
        stats.clone(),
    ));
    let (show_timeout, deliver_timeout) = config.render_timeouts();
    let supervisor = EncoderSupervisor::new(
        Arc::new(TokioLauncher::new(&config.ffmpeg)),
        Arc::new(SidecarPoller),
        ProgressReporter::new(renderer).with_timeouts(show_timeout, deliver_timeout),
        registry.clone(),
        Some(stats),
        config.supervisor_settings(),
    );

    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();

    let mut workers = vec![];
    for _ in 0..config.num {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let supervisor = supervisor.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, recv_from_queue, supervisor, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);

    let mut sweep = time::interval(config.sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(workers = config.num, queue_size = config.queue_size, "Server started");

    loop {
        // Waiting for something to else to happen to continue...
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            // Reclaim expired sessions
            _ = sweep.tick() => {
                service.sweep().await;
            },
            // Handle notifications from workers
            chan_msg = recv_from_worker.recv() => {
                let response = match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::JobStarted(job_id)) => {
                        debug!(message = "Started job", job_id = %job_id);
                        Response::JobStarted(job_id)
                    },
                    Some(WorkMessage::JobFinished(job_id, status)) => {
                        debug!(message = "Finished job", job_id = %job_id, status = %status);
                        Response::JobFinished(job_id, status)
                    },
                };
                if let Err(err) = send_to_client.send(response) {
                    error!(message = "Failed to send response to client", error = ?err);
                    cancel_token.cancel();
                    break;
                }
            },
            // Handle requests from clients
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(request) => {
                        let user_id = request.user_id();
                        let service = service.clone();
                        let send_to_client = send_to_client.clone();
                        // Requests may wait on probes or cancellations; the
                        // per-user lock in the service keeps them ordered.
                        tokio::spawn(
                            async move {
                                let response = handle_request(&service, request).await;
                                if let Err(err) = send_to_client.send(response) {
                                    error!(message = "Failed to send response to client", error = ?err);
                                }
                            }
                            .instrument(info_span!("request", user_id)),
                        );
                    }
                }
            }
        }
    }

    // Stop running encodes and resolve queued ones
    registry.cancel_all().await;

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

async fn handle_request(service: &Service, request: Request) -> Response {
    debug!(message = "Request", request = ?request);
    let user_id = request.user_id();
    let result = match request {
        Request::Media { user_id, media } => service.media_received(user_id, media).await,
        Request::Action { user_id, token } => service.handle_action(user_id, &token).await,
        Request::Cancel { user_id } => service.cancel(user_id).await,
        Request::Stats { user_id } => service.stats(user_id).await,
    };

    match result {
        Ok(view) => Response::View { user_id, view },
        Err(err) => {
            if err.is_rejection() {
                debug!(message = "Request rejected", error = %err);
            } else {
                warn!(message = "Request failed", error = %err);
            }
            Response::Rejected {
                user_id,
                error: err.to_string(),
            }
        }
    }
}
