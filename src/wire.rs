//! Newline-delimited JSON over TCP.
//!
//! The first line a client sends is a hello naming its tenant and actor:
//! `{"tenant":"physics","actor":"01J..."}`. Every later line is one request
//! tagged by `op`, answered by exactly one line: `{"ok":...}` or
//! `{"error":{"kind":...,"message":...}}`. After `{"op":"listen"}` the
//! connection only streams `{"notification":...}` lines for that actor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, SchedulingError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{self, request_label};
use crate::tenant::{Tenant, TenantManager};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type Lines<S> = Framed<S, LinesCodec>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Hello {
    pub tenant: String,
    pub actor: ActorId,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterActor {
        display_name: String,
    },
    CreateGroup {
        name: String,
        /// Omitted means every member may add, edit and delete.
        #[serde(default = "CapabilityGrants::all")]
        grants: CapabilityGrants,
    },
    JoinGroup {
        group_id: Ulid,
    },
    LeaveGroup {
        group_id: Ulid,
    },
    SetGrants {
        group_id: Ulid,
        grants: CapabilityGrants,
    },
    ArchiveGroup {
        group_id: Ulid,
    },
    DeleteGroup {
        group_id: Ulid,
    },
    GetGroup {
        group_id: Ulid,
    },
    CreateSchedule {
        group_ids: Vec<Ulid>,
        title: String,
        start: Ms,
        end: Ms,
        #[serde(default)]
        repeat_count: u32,
        #[serde(default)]
        notify: bool,
    },
    CreateGroupSchedule {
        group_id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        #[serde(default)]
        repeat_count: u32,
        #[serde(default)]
        notify: bool,
    },
    UpdateSchedule {
        event_id: Ulid,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        start: Option<Ms>,
        #[serde(default)]
        end: Option<Ms>,
        scope: Scope,
    },
    DeleteSchedule {
        event_id: Ulid,
        scope: Scope,
    },
    ListSchedules {
        #[serde(default)]
        groups: Option<Vec<Ulid>>,
    },
    GroupSchedule {
        group_id: Ulid,
    },
    Listen,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("line codec: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

fn ok_line(value: Value) -> String {
    json!({ "ok": value }).to_string()
}

fn error_line(kind: &str, message: &str) -> String {
    json!({ "error": { "kind": kind, "message": message } }).to_string()
}

/// Response payloads are plain structs, strings and ids, so encoding cannot fail.
fn encode<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub async fn process_connection<S>(socket: S, tenants: Arc<TenantManager>) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let (tenant, actor) = match handshake(&mut framed, &tenants).await {
        Ok(session) => session,
        Err(reason) => {
            metrics::counter!(observability::HANDSHAKE_FAILURES_TOTAL).increment(1);
            framed.send(error_line("handshake", &reason)).await?;
            return Err(WireError::Handshake(reason));
        }
    };
    framed
        .send(ok_line(json!({ "actor": actor })))
        .await?;

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                framed.send(error_line("limit_exceeded", "request line too long")).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                framed.send(error_line("validation", &format!("bad request: {e}"))).await?;
                continue;
            }
        };

        if matches!(request, Request::Listen) {
            let inbox = tenant.hub.subscribe(actor);
            framed.send(ok_line(json!("listening"))).await?;
            return listen(framed, &tenant, actor, inbox).await;
        }

        let label = request_label(&request);
        let start = Instant::now();
        let result = execute(&tenant.engine, actor, request).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => label, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => label)
            .record(start.elapsed().as_secs_f64());

        let reply = match result {
            Ok(value) => ok_line(value),
            Err(e) => {
                debug!(op = label, kind = e.kind(), "request rejected: {e}");
                error_line(e.kind(), &e.to_string())
            }
        };
        framed.send(reply).await?;
    }
    Ok(())
}

async fn handshake<S>(
    framed: &mut Lines<S>,
    tenants: &TenantManager,
) -> Result<(Tenant, ActorId), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match tokio::time::timeout(HELLO_TIMEOUT, framed.next()).await {
        Err(_) => return Err("no hello received".into()),
        Ok(None) => return Err("connection closed before hello".into()),
        Ok(Some(Err(e))) => return Err(e.to_string()),
        Ok(Some(Ok(line))) => line,
    };
    let hello: Hello = serde_json::from_str(&line).map_err(|e| format!("bad hello: {e}"))?;
    let tenant = tenants
        .get_or_create(&hello.tenant)
        .map_err(|e| format!("tenant error: {e}"))?;
    info!(tenant = %hello.tenant, actor = %hello.actor, "session opened");
    Ok((tenant, hello.actor))
}

async fn execute(engine: &Engine, actor: ActorId, request: Request) -> Result<Value, SchedulingError> {
    let value = match request {
        Request::RegisterActor { display_name } => {
            engine.register_actor(actor, display_name).await?;
            Value::Null
        }
        Request::CreateGroup { name, grants } => encode(engine.create_group(actor, name, grants).await?),
        Request::JoinGroup { group_id } => encode(engine.join_group(actor, group_id).await?),
        Request::LeaveGroup { group_id } => {
            engine.leave_group(actor, group_id).await?;
            Value::Null
        }
        Request::SetGrants { group_id, grants } => {
            encode(engine.set_grants(actor, group_id, grants).await?)
        }
        Request::ArchiveGroup { group_id } => encode(engine.archive_group(actor, group_id).await?),
        Request::DeleteGroup { group_id } => encode(engine.delete_group(actor, group_id).await?),
        Request::GetGroup { group_id } => encode(
            engine
                .group(&group_id)
                .await
                .ok_or(SchedulingError::NotFound(group_id))?,
        ),
        Request::CreateSchedule {
            group_ids,
            title,
            start,
            end,
            repeat_count,
            notify,
        } => {
            let request = NewSchedule {
                group_ids,
                title,
                start,
                end,
                repeat_count,
                notify,
            };
            encode(engine.create_for_groups(actor, request).await?)
        }
        Request::CreateGroupSchedule {
            group_id,
            title,
            start,
            end,
            repeat_count,
            notify,
        } => {
            let span = Span::try_new(start, end)
                .ok_or_else(|| SchedulingError::invalid("start must be before end"))?;
            encode(
                engine
                    .create_for_group(actor, group_id, title, span, repeat_count, notify)
                    .await?,
            )
        }
        Request::UpdateSchedule {
            event_id,
            title,
            start,
            end,
            scope,
        } => {
            let changes = ScheduleChanges { title, start, end };
            encode(engine.update_schedule(actor, event_id, changes, scope).await?)
        }
        Request::DeleteSchedule { event_id, scope } => {
            let deleted = engine.delete_schedule(actor, event_id, scope).await?;
            json!({ "deleted": deleted })
        }
        Request::ListSchedules { groups } => encode(engine.list_for_actor(actor, groups).await),
        Request::GroupSchedule { group_id } => encode(engine.list_for_group(actor, group_id).await?),
        Request::Listen => return Err(SchedulingError::invalid("listen is handled by the connection")),
    };
    Ok(value)
}

/// Push mode: forward the actor's notifications until the client goes away.
async fn listen<S>(
    mut framed: Lines<S>,
    tenant: &Tenant,
    actor: ActorId,
    mut inbox: broadcast::Receiver<Notification>,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = loop {
        tokio::select! {
            received = inbox.recv() => match received {
                Ok(notification) => {
                    let line = json!({ "notification": notification }).to_string();
                    if let Err(e) = framed.send(line).await {
                        break Err(e.into());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%actor, skipped, "listener fell behind, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
            line = framed.next() => match line {
                None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(_)) => {
                    if let Err(e) = framed
                        .send(error_line("validation", "connection is in listen mode"))
                        .await
                    {
                        break Err(e.into());
                    }
                }
            },
        }
    };
    drop(inbox);
    tenant.hub.remove_if_idle(&actor);
    result
}
