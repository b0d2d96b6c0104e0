// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-response requests, answered by one replica's services

use std::time::Duration;

use ot_core::{Clock, Run};
use ot_engine::{EngineError, ReplicaHandle, RunnerChannel};

use crate::protocol::{Request, Response, MAX_CLAIM_WAIT_MS, PROTOCOL_VERSION};

/// Handle a request and return its response; engine errors become
/// `Response::Error` with their class intact.
pub(super) async fn handle<C: Clock>(request: Request, replica: &ReplicaHandle<C>) -> Response {
    match dispatch(request, replica).await {
        Ok(response) => response,
        Err(e) => {
            debug_error(&e);
            e.into()
        }
    }
}

fn debug_error(e: &EngineError) {
    if e.is_retryable() {
        tracing::debug!(error = %e, "request failed, client may retry");
    } else {
        tracing::debug!(error = %e, "request rejected");
    }
}

fn run(run: Run) -> Response {
    Response::Run { run: Box::new(run) }
}

async fn dispatch<C: Clock>(
    request: Request,
    replica: &ReplicaHandle<C>,
) -> Result<Response, EngineError> {
    let response = match request {
        Request::Ping => Response::Pong,
        Request::Hello { .. } => Response::Hello {
            version: PROTOCOL_VERSION.to_string(),
        },

        Request::CreateRun {
            workspace_id,
            config_version_id,
            options,
        } => run(replica.runs.create(&workspace_id, &config_version_id, options)?),
        Request::GetRun { run_id } => run(replica.runs.get(&run_id)?),
        Request::ListRuns { filter } => Response::Runs {
            runs: replica.runs.list(&filter),
        },
        Request::EnqueuePlan { run_id } => run(replica.runs.enqueue_plan(&run_id)?),
        Request::ApplyRun {
            run_id,
            confirmed,
            user,
        } => run(replica.runs.apply(&run_id, confirmed, user.as_ref()).await?),
        Request::CancelRun { run_id } => Response::Canceled {
            outcome: replica.runs.cancel(&run_id)?,
        },
        Request::ForceCancelRun { run_id } => run(replica.runs.force_cancel(&run_id)?),
        Request::DiscardRun { run_id } => run(replica.runs.discard(&run_id)?),
        Request::DeleteRun { run_id } => {
            replica.runs.delete(&run_id)?;
            Response::Ok
        }

        Request::UpsertWorkspace { workspace } => Response::Workspace {
            workspace: replica.workspaces.upsert(workspace)?,
        },
        Request::GetWorkspace { workspace_id } => Response::Workspace {
            workspace: replica.workspaces.get(&workspace_id)?,
        },
        Request::DeleteWorkspace { workspace_id } => {
            replica.workspaces.delete(&workspace_id)?;
            Response::Ok
        }
        Request::UploadConfigVersion {
            workspace_id,
            speculative,
            tarball,
        } => Response::ConfigVersion {
            config_version: replica
                .workspaces
                .create_config_version(&workspace_id, speculative, tarball)
                .await?,
        },
        Request::GetConfigVersion { config_version_id } => Response::ConfigVersion {
            config_version: replica.workspaces.get_config_version(&config_version_id)?,
        },
        Request::LockWorkspace { workspace_id, user } => Response::Workspace {
            workspace: replica.workspaces.lock(&workspace_id, &user)?,
        },
        Request::UnlockWorkspace {
            workspace_id,
            subject,
            force,
        } => Response::Workspace {
            workspace: replica.workspaces.unlock(&workspace_id, &subject, force)?,
        },

        Request::ListUnallocated { pool } => Response::Jobs {
            jobs: replica.jobs.list_unallocated(pool.as_ref()),
        },
        Request::RegisterRunner {
            pool,
            name,
            max_jobs,
        } => Response::Runner {
            runner: replica.agent_channel(&pool).register(&name, max_jobs).await?,
        },
        Request::PingRunner {
            pool,
            runner_id,
            status,
        } => {
            replica.agent_channel(&pool).ping(&runner_id, status).await?;
            Response::Ok
        }
        Request::ClaimJob {
            pool,
            runner_id,
            wait_ms,
        } => {
            let wait = Duration::from_millis(wait_ms.min(MAX_CLAIM_WAIT_MS));
            let assignment = replica.agent_channel(&pool).claim_job(&runner_id, wait).await?;
            Response::Assignment {
                assignment: assignment.map(Box::new),
            }
        }
        Request::ReportProgress {
            pool,
            job_id,
            runner_id,
            chunk,
        } => Response::Signal {
            signal: replica
                .agent_channel(&pool)
                .report_progress(&job_id, &runner_id, chunk)
                .await?,
        },
        Request::ReportResult {
            pool,
            job_id,
            runner_id,
            outcome,
        } => {
            replica
                .agent_channel(&pool)
                .report_result(&job_id, &runner_id, outcome)
                .await?;
            Response::Ok
        }
        Request::DownloadConfig {
            pool,
            config_version_id,
        } => Response::Config {
            tarball: replica
                .agent_channel(&pool)
                .download_config(&config_version_id)
                .await?,
        },
        Request::DeregisterRunner { pool, runner_id } => {
            replica.agent_channel(&pool).deregister(&runner_id).await?;
            Response::Ok
        }

        Request::PutChunk { chunk } => {
            replica.logs.put_chunk(chunk)?;
            Response::Ok
        }
        Request::GetChunk {
            run_id,
            phase,
            offset,
            limit,
        } => Response::Chunk {
            chunk: replica.logs.get_chunk(&run_id, phase, offset, limit)?,
        },

        Request::Watch { .. } | Request::Tail { .. } => {
            return Err(EngineError::Validation(
                "streaming request answered as a single response".to_string(),
            ))
        }
    };
    Ok(response)
}
