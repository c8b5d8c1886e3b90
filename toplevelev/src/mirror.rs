//! X11 mirror windows for listed Wayland toplevels.
//!
//! The bridge owns its own thread, X connection and event loop. It consumes
//! value snapshots from the [`WorkQueue`] and never reads Wayland-side
//! state. Focus and close events on the mirror windows travel back as
//! [`Intent`]s over a calloop channel.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use calloop::channel::Sender;
use calloop::generic::Generic;
use calloop::ping::PingSource;
use calloop::{EventLoop, Interest, LoopSignal, Mode as PollMode, PostAction};

use x11rb::connection::Connection;
use x11rb::errors::ReplyOrIdError;
use x11rb::properties::{WmSizeHints, WmSizeHintsSpecification};
use x11rb::protocol::Event;
use x11rb::protocol::shape::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{
    AtomEnum, ClipOrdering, ConnectionExt as _, CreateWindowAux, EventMask, NotifyMode, PropMode,
    Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::work::{MirrorCommand, WorkQueue};
use crate::{Intent, ToplevelEventError};

/// Suffix appended to every mirror window title.
pub const PROXY_TAG: &str = "[PROXY]";

x11rb::atom_manager! {
    Atoms:
    AtomsCookie {
        WM_PROTOCOLS,
        WM_DELETE_WINDOW,
        _NET_WM_NAME,
        UTF8_STRING,
        _MOTIF_WM_HINTS,
        IS_WAYLAND_TOPLEVEL_PROXY,
    }
}

struct MirrorBridge {
    conn: RustConnection,
    root: Window,
    atoms: Atoms,
    queue: Arc<WorkQueue>,
    intents: Sender<Intent>,
    /// toplevel id to mirror window, and back.
    windows: HashMap<u64, Window>,
    by_window: HashMap<Window, u64>,
    signal: Option<LoopSignal>,
}

/// Owner's view of the bridge thread.
pub struct BridgeHandle {
    queue: Arc<WorkQueue>,
    thread: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Connect to the X server and start the bridge thread. An unreachable
    /// X server fails the whole startup.
    pub fn spawn(
        queue: Arc<WorkQueue>,
        wakeup: PingSource,
        intents: Sender<Intent>,
    ) -> Result<BridgeHandle, ToplevelEventError> {
        let (conn, screen_num) = x11rb::connect(None)?;
        let root = conn.setup().roots[screen_num].root;
        let atoms = Atoms::new(&conn)?.reply()?;
        let conn_fd = conn
            .stream()
            .as_fd()
            .try_clone_to_owned()
            .map_err(ToplevelEventError::BridgeSpawnError)?;

        let bridge = MirrorBridge {
            conn,
            root,
            atoms,
            queue: queue.clone(),
            intents,
            windows: HashMap::new(),
            by_window: HashMap::new(),
            signal: None,
        };
        let thread = std::thread::Builder::new()
            .name("x11-mirror".to_owned())
            .spawn(move || bridge_main(bridge, wakeup, conn_fd))
            .map_err(ToplevelEventError::BridgeSpawnError)?;

        Ok(BridgeHandle {
            queue,
            thread: Some(thread),
        })
    }

    /// Ask the bridge to exit and wait for it. The X connection going away
    /// takes the mirror windows with it.
    pub fn shutdown(&mut self) {
        self.queue.push(MirrorCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("x11 mirror thread panicked");
            }
        }
    }
}

fn bridge_main(mut bridge: MirrorBridge, wakeup: PingSource, conn_fd: OwnedFd) {
    let mut event_loop: EventLoop<MirrorBridge> =
        EventLoop::try_new().expect("Failed to create x11 mirror event loop");
    bridge.signal = Some(event_loop.get_signal());

    let handle = event_loop.handle();
    handle
        .insert_source(wakeup, |_, _, bridge: &mut MirrorBridge| {
            bridge.pump();
        })
        .expect("Failed to insert wakeup source");
    handle
        .insert_source(
            Generic::new(conn_fd, Interest::READ, PollMode::Level),
            |_, _, bridge: &mut MirrorBridge| {
                bridge.pump();
                Ok(PostAction::Continue)
            },
        )
        .expect("Failed to insert x11 connection source");

    // Commands may already be queued from before the thread started.
    bridge.pump();

    event_loop
        .run(None::<std::time::Duration>, &mut bridge, |_| {})
        .expect("x11 mirror event loop failed");
}

impl MirrorBridge {
    /// One cycle: X events first, then queued commands, then one flush for
    /// the whole batch.
    fn pump(&mut self) {
        self.drain_x_events();
        for command in self.queue.drain() {
            match command {
                MirrorCommand::Create {
                    toplevel,
                    title,
                    app_id,
                } => {
                    if let Err(err) = self.create_mirror(toplevel, &title, &app_id) {
                        log::warn!("failed to create mirror window for toplevel {toplevel}: {err}");
                    }
                }
                MirrorCommand::SetTitle { toplevel, title } => {
                    if let Err(err) = self.update_title(toplevel, &title) {
                        log::warn!("failed to retitle mirror window for toplevel {toplevel}: {err}");
                    }
                }
                MirrorCommand::Destroy { toplevel } => {
                    if let Err(err) = self.destroy_mirror(toplevel) {
                        log::warn!("failed to destroy mirror window for toplevel {toplevel}: {err}");
                    }
                }
                MirrorCommand::Shutdown => {
                    if let Some(signal) = &self.signal {
                        signal.stop();
                    }
                }
            }
        }
        if let Err(err) = self.conn.flush() {
            log::warn!("x11 flush failed: {err}");
        }
    }

    fn drain_x_events(&mut self) {
        loop {
            match self.conn.poll_for_event() {
                Ok(Some(event)) => self.handle_x_event(event),
                Ok(None) => break,
                Err(err) => {
                    log::warn!("x11 connection error: {err}");
                    break;
                }
            }
        }
    }

    fn handle_x_event(&mut self, event: Event) {
        match event {
            Event::FocusIn(focus) => {
                if focus.mode != NotifyMode::NORMAL {
                    return;
                }
                if let Some(&id) = self.by_window.get(&focus.event) {
                    self.send_intent(Intent::Activate(id));
                }
            }
            Event::ClientMessage(message) => {
                if message.format == 32
                    && message.data.as_data32()[0] == self.atoms.WM_DELETE_WINDOW
                {
                    if let Some(&id) = self.by_window.get(&message.window) {
                        self.send_intent(Intent::Close(id));
                    }
                }
            }
            _ => {}
        }
    }

    fn send_intent(&self, intent: Intent) {
        if self.intents.send(intent).is_err() {
            log::debug!("intent dropped: tracker loop is gone");
        }
    }

    fn create_mirror(
        &mut self,
        toplevel: u64,
        title: &str,
        app_id: &str,
    ) -> Result<(), ReplyOrIdError> {
        if self.windows.contains_key(&toplevel) {
            return Ok(());
        }
        let window = self.conn.generate_id()?;
        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            self.root,
            0,
            1,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new()
                .event_mask(EventMask::STRUCTURE_NOTIFY | EventMask::FOCUS_CHANGE),
        )?;

        self.conn.change_property32(
            PropMode::REPLACE,
            window,
            self.atoms.WM_PROTOCOLS,
            AtomEnum::ATOM,
            &[self.atoms.WM_DELETE_WINDOW],
        )?;
        // Lets window managers tell mirrors apart from real X clients.
        self.conn.change_property32(
            PropMode::REPLACE,
            window,
            self.atoms.IS_WAYLAND_TOPLEVEL_PROXY,
            AtomEnum::CARDINAL,
            &[1],
        )?;
        // MWM hints: decorations flag set, no decorations.
        self.conn.change_property32(
            PropMode::REPLACE,
            window,
            self.atoms._MOTIF_WM_HINTS,
            self.atoms._MOTIF_WM_HINTS,
            &[2, 0, 0, 0, 0],
        )?;
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_CLASS,
            AtomEnum::STRING,
            &wm_class_bytes(app_id),
        )?;

        let mut hints = WmSizeHints::default();
        hints.position = Some((WmSizeHintsSpecification::ProgramSpecified, 0, 1));
        hints.set_normal_hints(&self.conn, window)?;

        self.set_title_props(window, title)?;

        // Empty input region: clicks pass through, only focus matters.
        self.conn.shape_rectangles(
            shape::SO::SET,
            shape::SK::INPUT,
            ClipOrdering::UNSORTED,
            window,
            0,
            0,
            &[],
        )?;

        self.conn.map_window(window)?;

        self.windows.insert(toplevel, window);
        self.by_window.insert(window, toplevel);
        log::debug!("mirror window {window:#x} created for toplevel {toplevel}");
        Ok(())
    }

    fn update_title(&mut self, toplevel: u64, title: &str) -> Result<(), ReplyOrIdError> {
        let Some(&window) = self.windows.get(&toplevel) else {
            return Ok(());
        };
        self.set_title_props(window, title)?;
        Ok(())
    }

    fn set_title_props(&self, window: Window, title: &str) -> Result<(), ReplyOrIdError> {
        let tagged = mirror_title(title);
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            tagged.as_bytes(),
        )?;
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            self.atoms._NET_WM_NAME,
            self.atoms.UTF8_STRING,
            tagged.as_bytes(),
        )?;
        Ok(())
    }

    fn destroy_mirror(&mut self, toplevel: u64) -> Result<(), ReplyOrIdError> {
        let Some(window) = self.windows.remove(&toplevel) else {
            return Ok(());
        };
        self.by_window.remove(&window);
        self.conn.destroy_window(window)?;
        log::debug!("mirror window {window:#x} destroyed for toplevel {toplevel}");
        Ok(())
    }
}

/// Mirror windows carry the proxy tag so a window list never confuses them
/// with the toplevels they stand in for.
fn mirror_title(title: &str) -> String {
    if title.is_empty() {
        PROXY_TAG.to_owned()
    } else {
        format!("{title} {PROXY_TAG}")
    }
}

/// ICCCM WM_CLASS: instance and class, both NUL-terminated.
fn wm_class_bytes(app_id: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(app_id.len() * 2 + 2);
    bytes.extend_from_slice(app_id.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(app_id.as_bytes());
    bytes.push(0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_always_carry_the_proxy_tag() {
        assert_eq!(mirror_title("Editor"), "Editor [PROXY]");
        assert_eq!(mirror_title(""), "[PROXY]");
    }

    #[test]
    fn wm_class_doubles_the_app_id() {
        assert_eq!(wm_class_bytes("firefox"), b"firefox\0firefox\0");
        assert_eq!(wm_class_bytes(""), b"\0\0");
    }
}
