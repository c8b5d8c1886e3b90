//! Track Wayland toplevel windows and mirror them into X11.
//!
//! A [`Tracker`] speaks one of two foreign toplevel listing protocols
//! (legacy `zwlr_foreign_toplevel_manager_v1` or the standard
//! `ext_foreign_toplevel_list_v1`), keeps a registry of every listed
//! toplevel, and runs an X11 bridge thread that maintains one placeholder
//! window per toplevel. X11-side focus and close-button events travel back
//! to the compositor as activate and close requests.
//!
//! Startup is fully synchronous: after [`Tracker::build`] returns, the
//! protocol is selected and the X bridge is up. A display sync barrier then
//! separates the initial snapshot of toplevels from live updates; in list
//! mode the barrier ends the run, in watch mode events keep flowing until
//! the caller stops the loop.

mod foreign_toplevel;
mod mirror;
pub mod registry;
mod work;

pub use foreign_toplevel::{Capabilities, UsedProtocol, ZWLR_MIN_VERSION, select_protocol};
pub use mirror::{BridgeHandle, PROXY_TAG};
pub use registry::{Registry, StateFlags, ToplevelHandle, ToplevelRecord};
pub use work::{MirrorCommand, WorkQueue};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use calloop::channel::{self, Channel};
use calloop::{EventLoop, LoopSignal};
use calloop_wayland_source::WaylandSource;
use wayland_client::globals::{BindError, GlobalError, GlobalListContents, registry_queue_init};
use wayland_client::protocol::wl_callback::{self, WlCallback};
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::protocol::wl_seat::WlSeat;
use wayland_client::{ConnectError, Connection, Dispatch, QueueHandle, delegate_noop};
use wayland_protocols::ext::foreign_toplevel_list::v1::client::ext_foreign_toplevel_list_v1::ExtForeignToplevelListV1;
use wayland_protocols_wlr::foreign_toplevel::v1::client::zwlr_foreign_toplevel_manager_v1::ZwlrForeignToplevelManagerV1;

/// How long a run lasts and how chatty it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Snapshot the toplevels that exist at the sync barrier, then stop.
    #[default]
    List,
    /// Keep running, reporting creations, property changes and closures.
    Watch,
    /// Watch, plus per-flag state change lines.
    VerboseWatch,
}

/// Which listing protocol to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolChoice {
    /// Prefer ext, fall back to zwlr, fail if neither is usable.
    #[default]
    Auto,
    /// Require the legacy wlroots protocol.
    Zwlr,
    /// Require the standard ext protocol.
    Ext,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerOptions {
    pub mode: Mode,
    pub protocol: ProtocolChoice,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Globals bound, waiting for the initial snapshot to complete.
    AwaitingSnapshot,
    /// Past the barrier, streaming live updates.
    Streaming,
    /// The loop has been told to stop.
    Done,
}

/// A request flowing from the X11 bridge back to the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// A mirror window received focus; activate the real toplevel.
    Activate(u64),
    /// A mirror window was asked to close; close the real toplevel.
    Close(u64),
}

#[derive(thiserror::Error, Debug)]
pub enum ToplevelEventError {
    #[error("failed to connect to the wayland compositor: {0}")]
    WaylandConnect(#[from] ConnectError),
    #[error("wayland registry error: {0}")]
    WaylandGlobal(#[from] GlobalError),
    #[error("failed to bind wayland global: {0}")]
    WaylandBind(#[from] BindError),
    #[error("event loop error: {0}")]
    EventLoop(#[from] calloop::Error),
    #[error("failed to connect to the x server: {0}")]
    X11Connect(#[from] x11rb::errors::ConnectError),
    #[error("x11 setup failed: {0}")]
    X11Setup(#[from] x11rb::errors::ReplyError),
    #[error("x11 request failed: {0}")]
    X11Request(#[from] x11rb::errors::ConnectionError),
    #[error("failed to start the x11 mirror thread: {0}")]
    BridgeSpawnError(std::io::Error),
    #[error("compositor does not support {0}")]
    ProtocolUnsupported(&'static str),
    #[error("compositor supports no usable foreign toplevel protocol")]
    NoProtocol,
}

/// Mutable state driven by the dispatch loop.
pub struct TrackerState {
    mode: Mode,
    phase: Phase,
    used_protocol: UsedProtocol,
    seat: Option<WlSeat>,
    pub(crate) registry: Registry,
    signal: LoopSignal,
}

impl TrackerState {
    /// Closures and other live updates only matter past list mode.
    fn streaming(&self) -> bool {
        !matches!(self.mode, Mode::List)
    }

    /// The sync barrier came back: the initial snapshot is complete.
    fn sync_done(&mut self) {
        if self.phase != Phase::AwaitingSnapshot {
            return;
        }
        if matches!(self.mode, Mode::List) {
            self.phase = Phase::Done;
            self.signal.stop();
        } else {
            log::debug!("initial toplevel snapshot complete, streaming updates");
            self.phase = Phase::Streaming;
        }
    }

    /// The compositor sent `finished`: the manager is dead, stop cleanly.
    fn finish(&mut self) {
        self.phase = Phase::Done;
        self.signal.stop();
    }

    fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Activate(id) => match &self.seat {
                Some(seat) => self.registry.activate_by_id(id, seat),
                None => log::debug!("activate intent for toplevel {id} dropped: no wl_seat"),
            },
            Intent::Close(id) => self.registry.close_by_id(id),
        }
    }
}

/// Final result of a tracker run.
#[derive(Debug)]
pub struct Outcome {
    pub records: Vec<ToplevelRecord>,
    pub capabilities: Capabilities,
    pub used_protocol: UsedProtocol,
    /// The run ended because [`StopHandle::stop`] was called.
    pub interrupted: bool,
}

/// Cancels a running tracker from another thread, signal handlers included.
#[derive(Clone)]
pub struct StopHandle {
    signal: LoopSignal,
    interrupted: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.signal.stop();
        self.signal.wakeup();
    }
}

pub struct Tracker {
    connection: Connection,
    event_loop: EventLoop<'static, TrackerState>,
    state: TrackerState,
    bridge: BridgeHandle,
    interrupted: Arc<AtomicBool>,
    zwlr_manager: Option<ZwlrForeignToplevelManagerV1>,
    ext_list: Option<ExtForeignToplevelListV1>,
}

impl Tracker {
    /// Connect to both servers, select the listing protocol, start the
    /// mirror bridge and request the snapshot barrier.
    ///
    /// The X server is contacted before any toplevel global is bound, so an
    /// unreachable X side fails fast without half a session in flight.
    pub fn build(options: TrackerOptions) -> Result<Tracker, ToplevelEventError> {
        let connection = Connection::connect_to_env()?;
        let (globals, event_queue) = registry_queue_init::<TrackerState>(&connection)?;
        let qh = event_queue.handle();

        let advertised = globals.contents().clone_list();
        let used_protocol = select_protocol(&advertised, options.protocol)?;
        let capabilities = Capabilities::for_protocol(used_protocol);
        log::info!("using {}", used_protocol.name());

        let (queue, wakeup) =
            WorkQueue::new().map_err(ToplevelEventError::BridgeSpawnError)?;
        let (intent_tx, intent_rx) = channel::channel::<Intent>();
        let bridge = BridgeHandle::spawn(queue.clone(), wakeup, intent_tx)?;

        let event_loop: EventLoop<TrackerState> = EventLoop::try_new()?;

        let mut zwlr_manager = None;
        let mut ext_list = None;
        match used_protocol {
            UsedProtocol::Zwlr => {
                zwlr_manager = Some(globals.bind::<ZwlrForeignToplevelManagerV1, _, _>(
                    &qh,
                    ZWLR_MIN_VERSION..=ZWLR_MIN_VERSION,
                    (),
                )?);
            }
            UsedProtocol::Ext => {
                ext_list = Some(globals.bind::<ExtForeignToplevelListV1, _, _>(&qh, 1..=1, ())?);
            }
        }
        let seat = globals.bind::<WlSeat, _, _>(&qh, 1..=1, ()).ok();
        if seat.is_none() && used_protocol == UsedProtocol::Zwlr {
            log::warn!("no wl_seat advertised, activate requests will be dropped");
        }

        let mut registry = Registry::new(options.mode, queue);
        registry.set_capabilities(capabilities);
        let state = TrackerState {
            mode: options.mode,
            phase: Phase::AwaitingSnapshot,
            used_protocol,
            seat,
            registry,
            signal: event_loop.get_signal(),
        };

        // Barrier: everything that existed before this round trip is the
        // initial snapshot.
        connection.display().sync(&qh, ());

        WaylandSource::new(connection.clone(), event_queue)
            .insert(event_loop.handle())
            .expect("Failed to init wayland source");
        insert_intent_channel(&event_loop, intent_rx);

        Ok(Tracker {
            connection,
            event_loop,
            state,
            bridge,
            interrupted: Arc::new(AtomicBool::new(false)),
            zwlr_manager,
            ext_list,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            signal: self.event_loop.get_signal(),
            interrupted: self.interrupted.clone(),
        }
    }

    /// Run to completion: until the snapshot barrier in list mode, until
    /// stopped or finished in watch mode. Always tears down in order:
    /// toplevel handles, manager, Wayland flush, then the bridge thread.
    pub fn run(mut self) -> Result<Outcome, ToplevelEventError> {
        self.event_loop
            .run(None::<Duration>, &mut self.state, |_| {})?;

        let records = self.state.registry.records();
        let capabilities = Capabilities::for_protocol(self.state.used_protocol);

        self.state.registry.teardown();
        if let Some(manager) = &self.zwlr_manager {
            manager.stop();
        }
        if let Some(list) = &self.ext_list {
            list.stop();
            list.destroy();
        }
        if let Err(err) = self.connection.flush() {
            log::warn!("final wayland flush failed: {err}");
        }
        self.bridge.shutdown();

        Ok(Outcome {
            records,
            capabilities,
            used_protocol: self.state.used_protocol,
            interrupted: self.interrupted.load(Ordering::SeqCst),
        })
    }
}

fn insert_intent_channel(event_loop: &EventLoop<'static, TrackerState>, receiver: Channel<Intent>) {
    event_loop
        .handle()
        .insert_source(receiver, |event, _, state: &mut TrackerState| {
            if let channel::Event::Msg(intent) = event {
                state.handle_intent(intent);
            }
        })
        .expect("Failed to insert intent channel");
}

impl Dispatch<WlCallback, ()> for TrackerState {
    fn event(
        state: &mut Self,
        _proxy: &WlCallback,
        event: wl_callback::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            state.sync_done();
        }
    }
}

impl Dispatch<WlRegistry, GlobalListContents> for TrackerState {
    fn event(
        _state: &mut Self,
        _proxy: &WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global { interface, .. } = event {
            log::trace!("late global: {interface}");
        }
    }
}

delegate_noop!(TrackerState: ignore WlSeat);

#[cfg(test)]
mod tests {
    use super::*;

    fn state(mode: Mode) -> (TrackerState, EventLoop<'static, TrackerState>) {
        let event_loop: EventLoop<TrackerState> = EventLoop::try_new().unwrap();
        let (queue, source) = WorkQueue::new().unwrap();
        std::mem::forget(source);
        let state = TrackerState {
            mode,
            phase: Phase::AwaitingSnapshot,
            used_protocol: UsedProtocol::Ext,
            seat: None,
            registry: Registry::new(mode, queue),
            signal: event_loop.get_signal(),
        };
        (state, event_loop)
    }

    #[test]
    fn sync_barrier_ends_a_list_run() {
        let (mut state, _event_loop) = state(Mode::List);
        state.sync_done();
        assert_eq!(state.phase, Phase::Done);
        // A stray second barrier changes nothing.
        state.sync_done();
        assert_eq!(state.phase, Phase::Done);
    }

    #[test]
    fn sync_barrier_starts_streaming_in_watch_mode() {
        let (mut state, _event_loop) = state(Mode::Watch);
        assert!(state.streaming());
        state.sync_done();
        assert_eq!(state.phase, Phase::Streaming);

        state.finish();
        assert_eq!(state.phase, Phase::Done);
    }

    #[test]
    fn list_mode_never_streams() {
        let (state, _event_loop) = state(Mode::List);
        assert!(!state.streaming());
    }
}
