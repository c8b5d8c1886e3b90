//! The authoritative collection of tracked toplevels.
//!
//! All mutators run on the Wayland dispatch thread; the only thing that
//! crosses to the bridge thread is the value snapshots pushed onto the
//! [`WorkQueue`].

use std::collections::HashMap;
use std::sync::Arc;

use wayland_client::protocol::wl_seat::WlSeat;
use wayland_protocols::ext::foreign_toplevel_list::v1::client::ext_foreign_toplevel_handle_v1::ExtForeignToplevelHandleV1;
use wayland_protocols_wlr::foreign_toplevel::v1::client::zwlr_foreign_toplevel_handle_v1::ZwlrForeignToplevelHandleV1;

use crate::Mode;
use crate::foreign_toplevel::Capabilities;
use crate::work::{MirrorCommand, WorkQueue};

bitflags::bitflags! {
    /// The four window states of the zwlr protocol. They always arrive
    /// together as one state event and are replaced as a unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StateFlags: u8 {
        const FULLSCREEN = 1 << 0;
        const ACTIVATED = 1 << 1;
        const MAXIMIZED = 1 << 2;
        const MINIMIZED = 1 << 3;
    }
}

/// Requests a toplevel handle can issue back to the compositor.
///
/// The wire handle union implements this; registry tests substitute a
/// recording handle.
pub trait ProtocolHandle {
    /// Ask the compositor to focus the window.
    fn request_activate(&self, seat: &WlSeat);
    /// Ask the compositor to close the window. A polite request, apps may
    /// ignore it.
    fn request_close(&self);
    /// Destroy the client-side protocol object. Called exactly once, during
    /// toplevel teardown.
    fn release(&self);
}

/// One toplevel, exactly one wire representation.
#[derive(Debug)]
pub enum ToplevelHandle {
    Zwlr(ZwlrForeignToplevelHandleV1),
    Ext(ExtForeignToplevelHandleV1),
}

impl ProtocolHandle for ToplevelHandle {
    fn request_activate(&self, seat: &WlSeat) {
        match self {
            ToplevelHandle::Zwlr(handle) => handle.activate(seat),
            // The ext listing protocol has no control requests.
            ToplevelHandle::Ext(_) => {
                log::debug!("activate request dropped: ext protocol cannot activate")
            }
        }
    }

    fn request_close(&self) {
        match self {
            ToplevelHandle::Zwlr(handle) => handle.close(),
            ToplevelHandle::Ext(_) => {
                log::debug!("close request dropped: ext protocol cannot close")
            }
        }
    }

    fn release(&self) {
        match self {
            ToplevelHandle::Zwlr(handle) => handle.destroy(),
            ToplevelHandle::Ext(handle) => handle.destroy(),
        }
    }
}

struct Toplevel<H> {
    /// Process-local id, monotonically increasing, never reused. This is
    /// what command payloads and intents refer to.
    id: u64,
    handle: H,
    title: String,
    app_id: String,
    /// Stable identifier, ext protocol only. Set at most once.
    identifier: Option<String>,
    states: StateFlags,
    /// Set by the first done event; gates membership of the iteration
    /// order and the creation of the mirror window.
    listed: bool,
    /// A create command has been enqueued for this toplevel. Guards against
    /// a second mirror and gates title-update commands.
    mirror_requested: bool,
}

/// Flat snapshot of one listed toplevel, handed to output formatting.
///
/// `identifier` and `states` are `None` when the negotiated protocol does
/// not carry them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToplevelRecord {
    pub id: u64,
    pub title: String,
    pub app_id: String,
    pub identifier: Option<String>,
    pub states: Option<StateFlags>,
}

/// Registry of all known toplevels, keyed by the wire object id of their
/// handle. Iteration follows done order.
pub struct Registry<H: ProtocolHandle = ToplevelHandle> {
    mode: Mode,
    capabilities: Capabilities,
    queue: Arc<WorkQueue>,
    next_id: u64,
    toplevels: HashMap<u32, Toplevel<H>>,
    order: Vec<u32>,
}

impl<H: ProtocolHandle> Registry<H> {
    pub fn new(mode: Mode, queue: Arc<WorkQueue>) -> Self {
        Registry {
            mode,
            capabilities: Capabilities::empty(),
            queue,
            next_id: 0,
            toplevels: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    fn watching(&self) -> bool {
        matches!(self.mode, Mode::Watch | Mode::VerboseWatch)
    }

    /// Track a freshly announced toplevel. Not yet listed.
    pub fn create(&mut self, key: u32, handle: H) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if self.watching() {
            println!("toplevel {id}: created");
        }
        let previous = self.toplevels.insert(
            key,
            Toplevel {
                id,
                handle,
                title: String::new(),
                app_id: String::new(),
                identifier: None,
                states: StateFlags::empty(),
                listed: false,
                mirror_requested: false,
            },
        );
        // A reused wire key means the server never told us the old object
        // went away; tear the old toplevel down as if it had.
        if let Some(previous) = previous {
            log::warn!(
                "wire object id {key} was still tracked; replacing toplevel {}",
                previous.id
            );
            if previous.mirror_requested {
                self.queue.push(MirrorCommand::Destroy {
                    toplevel: previous.id,
                });
            }
            previous.handle.release();
            if previous.listed {
                self.order.retain(|&k| k != key);
            }
        }
        id
    }

    pub fn set_title(&mut self, key: u32, title: String) {
        let watching = self.watching();
        let Some(toplevel) = self.toplevels.get_mut(&key) else {
            return;
        };
        if watching {
            if toplevel.title.is_empty() {
                println!("toplevel {}: set title: '{title}'", toplevel.id);
            } else {
                println!(
                    "toplevel {}: change title: '{}' -> '{title}'",
                    toplevel.id, toplevel.title
                );
            }
        }
        toplevel.title = title;
        if toplevel.mirror_requested {
            self.queue.push(MirrorCommand::SetTitle {
                toplevel: toplevel.id,
                title: toplevel.title.clone(),
            });
        }
    }

    pub fn set_app_id(&mut self, key: u32, app_id: String) {
        let watching = self.watching();
        let Some(toplevel) = self.toplevels.get_mut(&key) else {
            return;
        };
        if watching {
            if toplevel.app_id.is_empty() {
                println!("toplevel {}: set app-id: '{app_id}'", toplevel.id);
            } else {
                println!(
                    "toplevel {}: change app-id: '{}' -> '{app_id}'",
                    toplevel.id, toplevel.app_id
                );
            }
        }
        toplevel.app_id = app_id;
    }

    /// The identifier is write-once; the server changing it is a protocol
    /// violation that is logged and otherwise ignored.
    pub fn set_identifier(&mut self, key: u32, identifier: String) {
        let watching = self.watching();
        let Some(toplevel) = self.toplevels.get_mut(&key) else {
            return;
        };
        if watching {
            println!("toplevel {}: set identifier: {identifier}", toplevel.id);
        }
        if toplevel.identifier.is_some() {
            log::warn!(
                "protocol-error: server changed the identifier of toplevel {}, \
                 which is forbidden; keeping the previous value",
                toplevel.id
            );
            return;
        }
        toplevel.identifier = Some(identifier);
    }

    /// Replace all four state booleans at once.
    pub fn set_state(&mut self, key: u32, states: StateFlags) {
        let verbose = matches!(self.mode, Mode::VerboseWatch);
        let Some(toplevel) = self.toplevels.get_mut(&key) else {
            return;
        };
        if verbose {
            let id = toplevel.id;
            println!(
                "toplevel {id}: fullscreen: {}",
                states.contains(StateFlags::FULLSCREEN)
            );
            println!(
                "toplevel {id}: activated (focused): {}",
                states.contains(StateFlags::ACTIVATED)
            );
            println!(
                "toplevel {id}: maximized: {}",
                states.contains(StateFlags::MAXIMIZED)
            );
            println!(
                "toplevel {id}: minimized: {}",
                states.contains(StateFlags::MINIMIZED)
            );
        }
        toplevel.states = states;
    }

    /// The initial burst of properties for this toplevel is complete.
    /// Idempotent: only the first call lists the toplevel and requests its
    /// mirror window.
    pub fn mark_done(&mut self, key: u32) {
        let Some(toplevel) = self.toplevels.get_mut(&key) else {
            return;
        };
        log::debug!("toplevel {}: done", toplevel.id);
        if toplevel.listed {
            return;
        }
        toplevel.listed = true;
        toplevel.mirror_requested = true;
        self.order.push(key);
        self.queue.push(MirrorCommand::Create {
            toplevel: toplevel.id,
            title: toplevel.title.clone(),
            app_id: toplevel.app_id.clone(),
        });
    }

    /// Drop a toplevel: request mirror teardown, release the protocol
    /// handle, unlist. Safe to call on a toplevel that never saw done.
    pub fn destroy(&mut self, key: u32) {
        let Some(toplevel) = self.toplevels.remove(&key) else {
            return;
        };
        if toplevel.mirror_requested {
            self.queue.push(MirrorCommand::Destroy {
                toplevel: toplevel.id,
            });
        }
        if self.watching() {
            println!("toplevel {}: destroyed", toplevel.id);
        }
        toplevel.handle.release();
        if toplevel.listed {
            self.order.retain(|&k| k != key);
        }
    }

    /// Drop every remaining toplevel. The windows are not closing, we are,
    /// so the watch-mode event lines are suppressed.
    pub fn teardown(&mut self) {
        self.mode = Mode::List;
        let keys: Vec<u32> = self.toplevels.keys().copied().collect();
        for key in keys {
            self.destroy(key);
        }
    }

    /// Snapshot all listed toplevels, in done order.
    pub fn records(&self) -> Vec<ToplevelRecord> {
        self.order
            .iter()
            .filter_map(|key| self.toplevels.get(key))
            .map(|toplevel| ToplevelRecord {
                id: toplevel.id,
                title: toplevel.title.clone(),
                app_id: toplevel.app_id.clone(),
                identifier: self
                    .capabilities
                    .contains(Capabilities::IDENTIFIER)
                    .then(|| toplevel.identifier.clone().unwrap_or_default()),
                states: self.capabilities.supports_state().then_some(toplevel.states),
            })
            .collect()
    }

    pub fn is_listed(&self, key: u32) -> bool {
        self.order.contains(&key)
    }

    /// Forward an activate intent from the bridge. Only reaches the
    /// compositor while the toplevel still has a live handle.
    pub fn activate_by_id(&self, id: u64, seat: &WlSeat) {
        if let Some(toplevel) = self.toplevels.values().find(|t| t.id == id) {
            toplevel.handle.request_activate(seat);
        }
    }

    /// Forward a close intent from the bridge.
    pub fn close_by_id(&self, id: u64) {
        if let Some(toplevel) = self.toplevels.values().find(|t| t.id == id) {
            toplevel.handle.request_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct Counters {
        released: Cell<u32>,
        closed: Cell<u32>,
    }

    struct RecordingHandle(Rc<Counters>);

    impl ProtocolHandle for RecordingHandle {
        fn request_activate(&self, _seat: &WlSeat) {}

        fn request_close(&self) {
            self.0.closed.set(self.0.closed.get() + 1);
        }

        fn release(&self) {
            self.0.released.set(self.0.released.get() + 1);
        }
    }

    fn registry() -> (Registry<RecordingHandle>, Arc<WorkQueue>) {
        let (queue, _source) = WorkQueue::new().unwrap();
        // Leak the ping source so the queue's wakeup fd stays valid for the
        // duration of the test.
        std::mem::forget(_source);
        (Registry::new(Mode::List, queue.clone()), queue)
    }

    fn handle() -> (RecordingHandle, Rc<Counters>) {
        let counters = Rc::new(Counters::default());
        (RecordingHandle(counters.clone()), counters)
    }

    #[test]
    fn listed_iff_done_and_not_closed() {
        let (mut registry, _queue) = registry();
        let (h, _) = handle();
        registry.create(7, h);
        registry.set_title(7, "Editor".into());
        assert!(registry.records().is_empty());

        registry.mark_done(7);
        assert_eq!(registry.records().len(), 1);
        assert!(registry.is_listed(7));

        registry.destroy(7);
        assert!(registry.records().is_empty());
        assert!(!registry.is_listed(7));
    }

    #[test]
    fn mark_done_is_idempotent() {
        let (mut registry, queue) = registry();
        let (h, _) = handle();
        registry.create(1, h);
        registry.mark_done(1);
        registry.mark_done(1);

        assert_eq!(registry.records().len(), 1);
        let creates = queue
            .drain()
            .into_iter()
            .filter(|c| matches!(c, MirrorCommand::Create { .. }))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn identifier_is_write_once() {
        let (mut registry, _queue) = registry();
        let (h, _) = handle();
        registry.create(1, h);
        registry.set_identifier(1, "first".into());
        registry.set_identifier(1, "second".into());
        registry.set_capabilities(Capabilities::IDENTIFIER);
        registry.mark_done(1);

        let records = registry.records();
        assert_eq!(records[0].identifier.as_deref(), Some("first"));
    }

    #[test]
    fn title_churn_before_done_yields_one_create_with_final_title() {
        let (mut registry, queue) = registry();
        let (h, _) = handle();
        registry.create(1, h);
        registry.set_title(1, "Editor".into());
        registry.set_title(1, "Editor (saved)".into());
        registry.mark_done(1);

        let commands = queue.drain();
        assert_eq!(
            commands,
            vec![MirrorCommand::Create {
                toplevel: 0,
                title: "Editor (saved)".into(),
                app_id: String::new(),
            }]
        );
    }

    #[test]
    fn title_update_after_done_enqueues_set_title() {
        let (mut registry, queue) = registry();
        let (h, _) = handle();
        registry.create(1, h);
        registry.mark_done(1);
        queue.drain();

        registry.set_title(1, "renamed".into());
        assert_eq!(
            queue.drain(),
            vec![MirrorCommand::SetTitle {
                toplevel: 0,
                title: "renamed".into(),
            }]
        );
    }

    #[test]
    fn destroy_before_done_enqueues_nothing_for_the_bridge() {
        let (mut registry, queue) = registry();
        let (h, counters) = handle();
        registry.create(1, h);
        registry.set_title(1, "short-lived".into());
        registry.destroy(1);

        assert!(queue.drain().is_empty());
        assert_eq!(counters.released.get(), 1);
    }

    #[test]
    fn destroy_releases_the_handle_exactly_once() {
        let (mut registry, queue) = registry();
        let (h, counters) = handle();
        registry.create(1, h);
        registry.mark_done(1);
        registry.destroy(1);
        // A second destroy for the same key is a no-op.
        registry.destroy(1);

        assert_eq!(counters.released.get(), 1);
        let destroys = queue
            .drain()
            .into_iter()
            .filter(|c| matches!(c, MirrorCommand::Destroy { .. }))
            .count();
        assert_eq!(destroys, 1);
    }

    #[test]
    fn reusing_a_tracked_key_tears_down_the_old_toplevel() {
        let (mut registry, queue) = registry();
        let (old, old_counters) = handle();
        registry.create(1, old);
        registry.mark_done(1);
        queue.drain();

        let (new, _) = handle();
        let new_id = registry.create(1, new);
        assert_eq!(old_counters.released.get(), 1);
        assert_eq!(queue.drain(), vec![MirrorCommand::Destroy { toplevel: 0 }]);
        assert!(registry.records().is_empty(), "replacement starts unlisted");

        registry.mark_done(1);
        assert_eq!(registry.records()[0].id, new_id);
    }

    #[test]
    fn close_intent_reaches_the_handle() {
        let (mut registry, _queue) = registry();
        let (h, counters) = handle();
        let id = registry.create(1, h);
        registry.mark_done(1);
        registry.close_by_id(id);
        assert_eq!(counters.closed.get(), 1);

        registry.destroy(1);
        registry.close_by_id(id);
        assert_eq!(counters.closed.get(), 1, "destroyed toplevels are unreachable");
    }

    #[test]
    fn records_follow_done_order() {
        let (mut registry, _queue) = registry();
        for key in [10, 20, 30] {
            let (h, _) = handle();
            registry.create(key, h);
        }
        registry.mark_done(30);
        registry.mark_done(10);

        let ids: Vec<u64> = registry.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 0]);
    }

    #[test]
    fn state_flags_unreported_without_state_support() {
        let (mut registry, _queue) = registry();
        let (h, _) = handle();
        registry.create(1, h);
        registry.set_state(1, StateFlags::ACTIVATED | StateFlags::MAXIMIZED);
        registry.mark_done(1);

        assert_eq!(registry.records()[0].states, None);

        registry.set_capabilities(Capabilities::for_protocol(
            crate::UsedProtocol::Zwlr,
        ));
        assert_eq!(
            registry.records()[0].states,
            Some(StateFlags::ACTIVATED | StateFlags::MAXIMIZED)
        );
    }
}
