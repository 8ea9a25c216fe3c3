//! Session provider that drives an engine binary over JSON lines.
//!
//! # Protocol
//!
//! Each session is one child process. Switchboard writes requests to its
//! stdin, one JSON object per line, tagged by `type`:
//!
//! ```text
//! {"type":"configure","sessionId":"…","workingDir":"…","tools":[…],…}
//! {"type":"prompt","prompt":"…","attachments":[…]}
//! {"type":"abort"}
//! {"type":"userInputResponse","requestId":"…","answer":"…","wasFreeform":true}
//! {"type":"userInputError","requestId":"…","error":"…"}
//! {"type":"permissionResponse","requestId":"…","decision":"approved"}
//! ```
//!
//! The engine writes [`EngineEvent`]s (tagged by `kind`) to stdout, plus two
//! control lines tagged by `type`: `userInputRequest` and
//! `permissionRequest`. Anything else on stdout is ignored; stderr goes to
//! the log.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::event::EngineEvent;
use super::provider::{
    Attachment, ProviderError, ProviderSession, SessionOptions, SessionProvider, ToolCapability,
};
use super::spawn::{EngineProcess, ProcessEvent, SpawnConfig, SpawnError};
use crate::logging::{log_line, open_log_file, LogHandle};
use crate::stream::bridge::{
    PermissionDecision, PermissionHandler, PermissionRequest, UserInputBridge,
};
use crate::stream::pending_input::UserInputPrompt;

#[derive(Debug, Clone)]
pub struct ProcessProviderConfig {
    pub program: String,
    pub args: Vec<String>,
    pub shell_prefix: Option<String>,
    /// Raw engine I/O is logged to `{log_dir}/engine-{session_id}.log`.
    pub log_dir: Option<PathBuf>,
}

impl ProcessProviderConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            shell_prefix: None,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum EngineRequest {
    Configure {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        working_dir: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        system_message: Option<String>,
        skill_dirs: Vec<PathBuf>,
        disabled_skills: Vec<String>,
        tools: Vec<ToolCapability>,
    },
    Prompt {
        prompt: String,
        attachments: Vec<Attachment>,
    },
    Abort,
    UserInputResponse {
        request_id: String,
        answer: String,
        was_freeform: bool,
    },
    UserInputError {
        request_id: String,
        error: String,
    },
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ControlLine {
    UserInputRequest {
        request_id: String,
        #[serde(flatten)]
        prompt: UserInputPrompt,
    },
    PermissionRequest {
        request_id: String,
        #[serde(flatten)]
        request: PermissionRequest,
    },
}

/// Where a session's output goes. Replaced when the session is resumed.
struct SessionWiring {
    events: mpsc::UnboundedSender<EngineEvent>,
    permission: PermissionHandler,
    user_input: UserInputBridge,
}

struct SessionHandle {
    conversation_id: String,
    process: Arc<EngineProcess>,
    wiring: Arc<Mutex<SessionWiring>>,
    reader: JoinHandle<()>,
}

type SessionMap = Mutex<HashMap<String, SessionHandle>>;

/// One engine process per live session. A conversation owns at most one:
/// spawning a new session for it stops the previous process, and a process
/// that exits drops out of the map.
pub struct ProcessSessionProvider {
    config: ProcessProviderConfig,
    sessions: Arc<SessionMap>,
}

impl ProcessSessionProvider {
    pub fn new(config: ProcessProviderConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Sessions whose engine process is still alive.
    pub fn running_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.process.is_running())
            .count()
    }

    fn process_for(&self, session_id: &str) -> Result<Arc<EngineProcess>, ProviderError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|h| Arc::clone(&h.process))
            .ok_or_else(|| ProviderError::UnknownSession(session_id.to_string()))
    }

    /// Rewire a live session to a new stream. Hands the wiring back if there
    /// is no running process for it.
    fn rewire(&self, session_id: &str, wiring: SessionWiring) -> Result<(), SessionWiring> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(session_id) {
            Some(handle) if handle.process.is_running() => {
                handle.conversation_id = wiring.user_input.conversation_id().to_string();
                *handle.wiring.lock().unwrap() = wiring;
                Ok(())
            }
            _ => Err(wiring),
        }
    }

    /// Remove every session owned by `conversation_id`.
    fn take_conversation_sessions(&self, conversation_id: &str) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.lock().unwrap();
        let ids: Vec<String> = sessions
            .iter()
            .filter(|(_, h)| h.conversation_id == conversation_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| sessions.remove(id)).collect()
    }
}

/// Stop the readers and processes of removed sessions.
async fn retire(handles: Vec<SessionHandle>) {
    let stops = handles.into_iter().map(|handle| {
        handle.reader.abort();
        let process = handle.process;
        tokio::task::spawn_blocking(move || process.stop())
    });
    futures::future::join_all(stops).await;
}

fn write_request(process: &EngineProcess, request: &EngineRequest) -> Result<(), SpawnError> {
    let line = serde_json::to_string(request).map_err(|e| SpawnError::Write(e.into()))?;
    process.write_line(&line)
}

#[async_trait]
impl SessionProvider for ProcessSessionProvider {
    async fn get_or_create_session(
        &self,
        options: SessionOptions,
    ) -> Result<ProviderSession, ProviderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let wiring = SessionWiring {
            events: tx,
            permission: options.permission.clone(),
            user_input: options.user_input.clone(),
        };

        let wiring = match options.resume_session_id.as_deref() {
            Some(resume_id) => match self.rewire(resume_id, wiring) {
                Ok(()) => {
                    log::info!("Reattached to live engine session {}", resume_id);
                    return Ok(ProviderSession {
                        session_id: resume_id.to_string(),
                        events: rx,
                    });
                }
                Err(wiring) => wiring,
            },
            None => wiring,
        };

        let session_id = options
            .resume_session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let conversation_id = options.user_input.conversation_id().to_string();

        let replaced = self.take_conversation_sessions(&conversation_id);
        if !replaced.is_empty() {
            log::info!(
                "Stopping {} previous engine session(s) for {}",
                replaced.len(),
                conversation_id
            );
            retire(replaced).await;
        }

        let mut spawn = SpawnConfig::new(&self.config.program, self.config.args.clone())
            .working_dir(&options.working_dir);
        if let Some(prefix) = &self.config.shell_prefix {
            spawn = spawn.shell_prefix(prefix.clone());
        }

        let mut process =
            EngineProcess::spawn(&spawn).map_err(|e| ProviderError::Create(e.to_string()))?;
        let output = process
            .take_events()
            .ok_or_else(|| ProviderError::Create("engine output already taken".to_string()))?;
        let process = Arc::new(process);

        let configure = EngineRequest::Configure {
            session_id: session_id.clone(),
            resume_session_id: options.resume_session_id.clone(),
            model: options.model.clone(),
            working_dir: options.working_dir.clone(),
            system_message: options.system_message.clone(),
            skill_dirs: options.skill_dirs.clone(),
            disabled_skills: options.disabled_skills.clone(),
            tools: options.tools.clone(),
        };
        if let Err(e) = write_request(&process, &configure) {
            process.kill();
            return Err(ProviderError::Create(e.to_string()));
        }

        let transcript = open_log_file(
            self.config.log_dir.as_deref(),
            &format!("engine-{session_id}"),
        );
        let wiring = Arc::new(Mutex::new(wiring));
        let reader = tokio::spawn(read_engine_output(
            session_id.clone(),
            Arc::clone(&process),
            output,
            Arc::clone(&wiring),
            Arc::downgrade(&self.sessions),
            transcript,
        ));

        log::info!(
            "Spawned engine session {} in {}",
            session_id,
            options.working_dir.display()
        );

        let previous = self.sessions.lock().unwrap().insert(
            session_id.clone(),
            SessionHandle {
                conversation_id,
                process,
                wiring,
                reader,
            },
        );
        if let Some(previous) = previous {
            previous.reader.abort();
            previous.process.kill();
        }

        Ok(ProviderSession {
            session_id,
            events: rx,
        })
    }

    async fn send_message(
        &self,
        session_id: &str,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<(), ProviderError> {
        let process = self.process_for(session_id)?;
        let request = EngineRequest::Prompt {
            prompt: prompt.to_string(),
            attachments: attachments.to_vec(),
        };
        write_request(&process, &request).map_err(|e| ProviderError::Send(e.to_string()))
    }

    async fn abort_message(&self, session_id: &str) -> Result<(), ProviderError> {
        let process = self.process_for(session_id)?;
        write_request(&process, &EngineRequest::Abort)
            .map_err(|e| ProviderError::Abort(e.to_string()))
    }

    async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .lock()
            .unwrap()
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        log::info!("Stopping {} engine process(es)", handles.len());
        retire(handles).await;
    }
}

async fn read_engine_output(
    session_id: String,
    process: Arc<EngineProcess>,
    mut output: mpsc::UnboundedReceiver<ProcessEvent>,
    wiring: Arc<Mutex<SessionWiring>>,
    sessions: Weak<SessionMap>,
    transcript: LogHandle,
) {
    while let Some(event) = output.recv().await {
        match event {
            ProcessEvent::Stdout(line) => {
                log_line(&transcript, "STDOUT", &line);
                handle_stdout_line(&session_id, &line, &process, &wiring);
            }
            ProcessEvent::Stderr(line) => {
                log_line(&transcript, "STDERR", &line);
                log::debug!("[{}] stderr: {}", session_id, line);
            }
            ProcessEvent::Exit(code) => {
                log_line(&transcript, "EXIT", &format!("{:?}", code));
                log::info!("Engine session {} exited with {:?}", session_id, code);

                let events = wiring.lock().unwrap().events.clone();
                if code != Some(0) {
                    let message = match code {
                        Some(code) => format!("Engine exited with code {code}"),
                        None => "Engine was terminated".to_string(),
                    };
                    let _ = events.send(EngineEvent::Error { message });
                }
                let _ = events.send(EngineEvent::Idle);

                if let Some(map) = sessions.upgrade() {
                    let mut map = map.lock().unwrap();
                    if map
                        .get(&session_id)
                        .is_some_and(|h| Arc::ptr_eq(&h.process, &process))
                    {
                        map.remove(&session_id);
                    }
                }
                break;
            }
        }
    }
}

fn handle_stdout_line(
    session_id: &str,
    line: &str,
    process: &Arc<EngineProcess>,
    wiring: &Arc<Mutex<SessionWiring>>,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    if let Ok(control) = serde_json::from_str::<ControlLine>(line) {
        match control {
            ControlLine::UserInputRequest { request_id, prompt } => {
                let bridge = wiring.lock().unwrap().user_input.clone();
                let process = Arc::clone(process);
                tokio::spawn(async move {
                    let reply = match bridge.ask(prompt).await {
                        Ok(response) => EngineRequest::UserInputResponse {
                            request_id,
                            answer: response.answer,
                            was_freeform: response.was_freeform,
                        },
                        Err(e) => EngineRequest::UserInputError {
                            request_id,
                            error: e.to_string(),
                        },
                    };
                    if let Err(e) = write_request(&process, &reply) {
                        log::warn!("Failed to deliver user input reply: {}", e);
                    }
                });
            }
            ControlLine::PermissionRequest {
                request_id,
                request,
            } => {
                let decision = wiring.lock().unwrap().permission.decide(&request);
                let reply = EngineRequest::PermissionResponse {
                    request_id,
                    decision,
                };
                if let Err(e) = write_request(process, &reply) {
                    log::warn!("Failed to deliver permission decision: {}", e);
                }
            }
        }
        return;
    }

    match serde_json::from_str::<EngineEvent>(line) {
        Ok(event) => {
            let _ = wiring.lock().unwrap().events.send(event);
        }
        Err(_) => log::debug!("[{}] ignoring stdout line: {}", session_id, line),
    }
}
