//! Render adaptor
//!
//! Implements [`Adaptor`] by keeping one hosted application resident for the
//! whole session:
//!
//! ```text
//!  on_init ── validate init data, keep path mapping
//!  on_start ─ spawn host ─ connect ─ set_renderer, path_mapping, scene actions
//!  on_run ─── start_render (watching fatal output and early exit)
//!  on_cleanup close ─ wait ─ terminate
//! ```

use super::dispatch::{ActionTimeouts, DispatchLoop, FatalLatch, START_RENDER};
use super::host_process::{HostCommand, HostProcess, HostTerminator};
use super::lifecycle::Adaptor;
use super::status::StatusReporter;
use crate::action::{ActionHandle, ActionQueue};
use crate::channel::{generate_token, ChannelConnection, CHANNEL_PATH_ENV, CHANNEL_TOKEN_ENV};
use crate::client::{CLOSE, SET_RENDERER};
use crate::config::AdaptorConfig;
use crate::error::{AdaptorError, ChannelError, Error, Result};
use crate::monitor::{builtin_rules, MonitorEvent, OutputMonitor, ProcessControl, RecentLines};
use crate::pathmap::{ArnoldPathmap, PathMapper, ARNOLD_PATHMAP_ENV};
use crate::render::{HandlerRegistry, Renderer};
use crate::types::{ActionArgs, InitData, RunData};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SOCKET_NAME: &str = "channel.sock";
const PATH_MAPPING: &str = "path_mapping";

/// Time allowed for the exit status to appear after the channel drops
const EXIT_SETTLE: Duration = Duration::from_secs(3);
/// Time allowed for background tasks to finish during cleanup
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Prepared {
    data: InitData,
    renderer: Renderer,
}

/// Everything that lives between `on_start` and `on_cleanup`
struct Session {
    renderer: Renderer,
    queue: Arc<ActionQueue>,
    host: HostProcess,
    fatal: FatalLatch,
    recent: Arc<RecentLines>,
    dispatch: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    _socket_dir: tempfile::TempDir,
    _arnold_pathmap: Option<ArnoldPathmap>,
}

impl Session {
    fn fatal_error(&self, message: String) -> Error {
        Error::Adaptor(AdaptorError::Fatal {
            message,
            recent_output: self.recent.snapshot(),
        })
    }

    fn exited_error(&self, code: Option<i32>) -> Error {
        Error::Adaptor(AdaptorError::HostExited {
            code,
            recent_output: self.recent.snapshot(),
        })
    }

    /// Fail early if the session is already dead
    fn check_alive(&self) -> Result<()> {
        if let Some(message) = self.fatal.cause() {
            return Err(self.fatal_error(message));
        }
        if let Some(exit) = self.host.exit() {
            return Err(self.exited_error(exit.code));
        }
        Ok(())
    }

    /// Wait for an action while watching for fatal output and host exit
    async fn await_action(&self, handle: ActionHandle, timeout: Option<Duration>) -> Result<serde_json::Value> {
        let name = handle.name().to_string();
        let mut fatal = self.fatal.subscribe();
        let mut exit = self.host.exit_watch();
        let mut fatal_open = true;
        let mut exit_open = true;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        let wait = handle.wait();
        tokio::pin!(wait);

        loop {
            self.check_alive()?;
            tokio::select! {
                outcome = &mut wait => {
                    return match outcome.into_result() {
                        Err(Error::Channel(e)) => Err(self.explain_channel_failure(e).await),
                        other => other,
                    };
                }
                changed = fatal.changed(), if fatal_open => {
                    if changed.is_err() {
                        fatal_open = false;
                    }
                }
                changed = exit.changed(), if exit_open => {
                    if changed.is_err() {
                        exit_open = false;
                    }
                }
                _ = sleep_until(deadline) => {
                    return Err(Error::Channel(ChannelError::Timeout {
                        action: name,
                        limit: timeout.unwrap_or_default(),
                    }));
                }
            }
        }
    }

    /// A dropped channel is usually a symptom; report the cause if one shows up
    async fn explain_channel_failure(&self, error: ChannelError) -> Error {
        if let Some(message) = self.fatal.cause() {
            return self.fatal_error(message);
        }
        if let Some(exit) = self.host.wait_timeout(EXIT_SETTLE).await {
            return self.exited_error(exit.code);
        }
        Error::Channel(error)
    }

    fn enqueue(&self, name: &str, args: ActionArgs) -> Result<ActionHandle> {
        Ok(self.queue.enqueue(name, args)?)
    }
}

#[derive(Default)]
struct State {
    prepared: Option<Prepared>,
    session: Option<Session>,
    stopped: bool,
}

/// Adaptor that renders through a resident hosted application
pub struct RenderAdaptor {
    config: AdaptorConfig,
    mapper: PathMapper,
    registry: HandlerRegistry,
    status: Arc<StatusReporter>,
    state: Mutex<State>,
    terminator: parking_lot::Mutex<Option<HostTerminator>>,
}

impl RenderAdaptor {
    pub fn new(config: AdaptorConfig) -> Self {
        Self {
            config,
            mapper: PathMapper::default(),
            registry: HandlerRegistry::builtin(),
            status: Arc::new(StatusReporter::stdout()),
            state: Mutex::new(State::default()),
            terminator: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_path_mapping(mut self, mapper: PathMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_status_reporter(mut self, status: Arc<StatusReporter>) -> Self {
        self.status = status;
        self
    }

    pub fn config(&self) -> &AdaptorConfig {
        &self.config
    }

    /// Whether a session is running and its host is alive
    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        state.session.as_ref().is_some_and(|s| s.host.is_running())
    }

    /// Apply path mapping to the path-valued arguments of `command`
    fn map_paths(&self, renderer: Renderer, command: &str, mut args: ActionArgs) -> ActionArgs {
        if self.mapper.is_empty() {
            return args;
        }
        for name in self.registry.path_params(renderer, command) {
            if let Some(path) = args.get_str(name).map(|p| self.mapper.map(p)) {
                args.insert(name, path);
            }
        }
        args
    }

    fn timeouts(&self) -> ActionTimeouts {
        ActionTimeouts {
            default: Some(self.config.init_action_timeout()),
            render: self.config.render_timeout(),
            close: Some(self.config.shutdown_timeout()),
        }
    }

    async fn launch(&self, prepared: &Prepared) -> Result<Session> {
        let socket_dir = tempfile::Builder::new().prefix("stickyrender").tempdir()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_dir.path(), std::fs::Permissions::from_mode(0o700))?;
        }
        let socket_path: PathBuf = socket_dir.path().join(SOCKET_NAME);
        let token = generate_token();

        let mut command = HostCommand::new(&self.config.host_program);
        command.args = self.config.host_args.clone();
        command.env = self.config.host_env.clone();
        let mut command = command
            .env(CHANNEL_PATH_ENV, socket_path.to_string_lossy())
            .env(CHANNEL_TOKEN_ENV, token.as_str());

        let arnold_pathmap = if prepared.renderer == Renderer::Arnold && !self.mapper.is_empty() {
            let pathmap = self.mapper.write_arnold_pathmap()?;
            command = command.env(ARNOLD_PATHMAP_ENV, pathmap.path().to_string_lossy());
            Some(pathmap)
        } else {
            None
        };

        let (control, control_rx) = ProcessControl::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(OutputMonitor::new(
            builtin_rules(&prepared.data),
            control,
            Arc::new(event_tx),
            self.config.recent_output_lines,
        ));
        let recent = monitor.recent();

        let fatal = FatalLatch::new();
        let pump = tokio::spawn(pump_events(event_rx, self.status.clone(), fatal.clone()));

        let host = HostProcess::spawn(&command, monitor, control_rx, self.config.terminate_grace())?;
        *self.terminator.lock() = Some(host.terminator());

        let exit_watch = host.exit_watch();
        let options = self.config.connect_options(Some(token));
        let connection =
            match ChannelConnection::connect_with_backoff(&socket_path, &options, || exit_watch.borrow().is_none()).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Could not connect to the hosted application: {}", e);
                    let mut host = host;
                    let exit = match host.exit() {
                        Some(exit) => exit,
                        None => host.shutdown(self.config.terminate_grace()).await,
                    };
                    return Err(match e {
                        // Only raised once the host has gone away
                        ChannelError::ConnectFailed(_) => Error::Adaptor(AdaptorError::HostExited {
                            code: exit.code,
                            recent_output: recent.snapshot(),
                        }),
                        other => Error::Channel(other),
                    });
                }
            };

        let queue = Arc::new(ActionQueue::new());
        let dispatch = DispatchLoop::new(queue.clone(), Arc::new(connection), fatal.clone(), self.timeouts())
            .with_terminator(host.terminator(), self.config.terminate_grace())
            .spawn();

        Ok(Session {
            renderer: prepared.renderer,
            queue,
            host,
            fatal,
            recent,
            dispatch: Some(dispatch),
            pump: Some(pump),
            _socket_dir: socket_dir,
            _arnold_pathmap: arnold_pathmap,
        })
    }

    /// Renderer selection, path mapping, then the scene actions, one at a time
    fn init_actions(&self, prepared: &Prepared) -> Vec<(String, ActionArgs)> {
        let mut actions = vec![(
            SET_RENDERER.to_string(),
            ActionArgs::new().with("renderer", prepared.renderer.as_str()),
        )];
        if !self.mapper.is_empty() {
            actions.push((PATH_MAPPING.to_string(), self.mapper.to_action_args()));
        }
        for (name, args) in prepared.data.scene_actions() {
            actions.push((name.to_string(), self.map_paths(prepared.renderer, name, args)));
        }
        actions
    }

    async fn teardown(&self, mut session: Session) -> Result<()> {
        if session.host.is_running() && session.fatal.cause().is_none() {
            match session.enqueue(CLOSE, ActionArgs::new()) {
                Ok(handle) => {
                    if let Err(e) = session.await_action(handle, Some(self.config.shutdown_timeout())).await {
                        debug!("Close did not complete cleanly: {}", e);
                    }
                }
                Err(e) => debug!("Could not enqueue close: {}", e),
            }
            match session.host.wait_timeout(self.config.shutdown_timeout()).await {
                Some(exit) if !exit.success() => {
                    warn!("Hosted application exited with code {:?} after close", exit.code);
                }
                Some(_) => info!("Hosted application exited"),
                None => warn!(
                    "Hosted application still running {}s after close; terminating",
                    self.config.shutdown_timeout().as_secs()
                ),
            }
        }

        if session.host.is_running() {
            let exit = session.host.shutdown(self.config.terminate_grace()).await;
            debug!("Hosted application stopped ({:?})", exit.code);
        }
        session.queue.close();

        if let Some(dispatch) = session.dispatch.take() {
            join_or_abort(dispatch, "dispatch loop").await;
        }
        if let Some(pump) = session.pump.take() {
            join_or_abort(pump, "event pump").await;
        }

        match session.fatal.cause() {
            Some(message) => Err(session.fatal_error(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Adaptor for RenderAdaptor {
    async fn on_init(&self, init: InitData) -> Result<()> {
        init.validate()?;
        let renderer = init.renderer()?;

        let mut state = self.state.lock().await;
        if state.session.is_some() {
            return Err(AdaptorError::AlreadyStarted.into());
        }
        info!("Initialised for {} (scene {})", renderer, init.scene_file);
        state.prepared = Some(Prepared { data: init, renderer });
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.session.is_some() {
            return Err(AdaptorError::AlreadyStarted.into());
        }
        let prepared = state.prepared.as_ref().ok_or(AdaptorError::NotInitialized)?;

        self.status.status("Launching the hosted application");
        let actions = self.init_actions(prepared);
        let session = self.launch(prepared).await?;
        let session = state.session.insert(session);
        state.stopped = false;

        let total = actions.len();
        for (index, (name, args)) in actions.into_iter().enumerate() {
            debug!("Init action {}/{}: {}", index + 1, total, name);
            let handle = session.enqueue(&name, args)?;
            session.await_action(handle, None).await?;
        }

        self.status.status("Scene loaded");
        info!("Hosted application ready ({} init actions)", total);
        Ok(())
    }

    async fn on_run(&self, run: RunData) -> Result<()> {
        let state = self.state.lock().await;
        let session = state.session.as_ref().ok_or(AdaptorError::NotRunning)?;
        session.check_alive()?;

        self.status.reset();
        self.status.status(&format!("Rendering frame {}", run.frame));
        let args = self.map_paths(session.renderer, START_RENDER, run.to_args());
        let handle = session.enqueue(START_RENDER, args)?;
        let result = session.await_action(handle, None).await?;

        debug!("start_render returned {}", result);
        self.status.progress(100.0);
        info!("Finished frame {}", run.frame);
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.stopped {
            state.stopped = true;
            if state.session.is_some() {
                self.status.status("Finished rendering");
            }
        }
        Ok(())
    }

    async fn on_cleanup(&self) -> Result<()> {
        let session = {
            let mut state = self.state.lock().await;
            state.stopped = true;
            state.session.take()
        };
        let result = match session {
            Some(session) => self.teardown(session).await,
            None => Ok(()),
        };
        *self.terminator.lock() = None;
        result
    }

    async fn on_cancel(&self) -> Result<()> {
        let terminator = self.terminator.lock().clone();
        match terminator {
            Some(terminator) => {
                warn!("Cancelling: killing the hosted application");
                self.status.status("Cancelling");
                terminator.terminate(Duration::ZERO);
            }
            None => debug!("Nothing to cancel"),
        }
        Ok(())
    }
}

/// Forward monitor events to the status reporter and the fatal latch
async fn pump_events(mut events: mpsc::UnboundedReceiver<MonitorEvent>, status: Arc<StatusReporter>, fatal: FatalLatch) {
    while let Some(event) = events.recv().await {
        match event {
            MonitorEvent::Progress { percent } => status.progress(f32::from(percent)),
            MonitorEvent::FrameComplete { frame } => {
                status.progress(100.0);
                debug!("Frame {} complete", frame);
            }
            MonitorEvent::HostVersion { version } => info!("Hosted application version {}", version),
            MonitorEvent::Warning { message } => warn!("{}", message),
            MonitorEvent::Error { message, fatal: true } => {
                fatal.trip(message);
            }
            MonitorEvent::Error { message, fatal: false } => warn!("{}", message),
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join_or_abort(handle: JoinHandle<()>, what: &str) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => warn!("{} failed: {}", what, e),
        Err(_) => {
            warn!("{} did not finish; aborting", what);
            abort.abort();
        }
    }
}
