//! Foreign toplevel protocol selection and event handling.
//!
//! Exactly one of two listing protocols drives a session: the legacy
//! wlroots `zwlr_foreign_toplevel_manager_v1` (version 3 or later) or the
//! standard `ext_foreign_toplevel_list_v1`. Which properties a session can
//! report follows from that choice.

use wayland_client::globals::Global;
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle};

use wayland_protocols::ext::foreign_toplevel_list::v1::client::{
    ext_foreign_toplevel_handle_v1::{self, ExtForeignToplevelHandleV1},
    ext_foreign_toplevel_list_v1::{self, ExtForeignToplevelListV1},
};
use wayland_protocols_wlr::foreign_toplevel::v1::client::{
    zwlr_foreign_toplevel_handle_v1::{self, ZwlrForeignToplevelHandleV1},
    zwlr_foreign_toplevel_manager_v1::{self, ZwlrForeignToplevelManagerV1},
};

use crate::registry::{StateFlags, ToplevelHandle};
use crate::{ProtocolChoice, ToplevelEventError, TrackerState};

/// The toplevel listing protocol a session ended up speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedProtocol {
    /// zwlr_foreign_toplevel_manager_v1, version 3.
    Zwlr,
    /// ext_foreign_toplevel_list_v1, version 1.
    Ext,
}

impl UsedProtocol {
    pub fn name(self) -> &'static str {
        match self {
            UsedProtocol::Zwlr => "zwlr_foreign_toplevel_manager_v1",
            UsedProtocol::Ext => "ext_foreign_toplevel_list_v1",
        }
    }
}

/// Versions below this lack the `finished` event we rely on for teardown.
pub const ZWLR_MIN_VERSION: u32 = 3;

bitflags::bitflags! {
    /// Which per-toplevel properties the negotiated protocol can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        const FULLSCREEN = 1 << 0;
        const ACTIVATED = 1 << 1;
        const MAXIMIZED = 1 << 2;
        const MINIMIZED = 1 << 3;
        const IDENTIFIER = 1 << 4;
    }
}

impl Capabilities {
    pub fn for_protocol(protocol: UsedProtocol) -> Self {
        match protocol {
            UsedProtocol::Zwlr => {
                Capabilities::FULLSCREEN
                    | Capabilities::ACTIVATED
                    | Capabilities::MAXIMIZED
                    | Capabilities::MINIMIZED
            }
            UsedProtocol::Ext => Capabilities::IDENTIFIER,
        }
    }

    /// True when the protocol reports any window state at all. The four
    /// state flags come and go together.
    pub fn supports_state(self) -> bool {
        self.contains(Capabilities::ACTIVATED)
    }
}

/// Pick the listing protocol from the advertised globals.
///
/// When forced, the named protocol must be present at a usable version or
/// selection fails outright. When automatic, the standard ext protocol wins
/// over the legacy one.
pub fn select_protocol(
    globals: &[Global],
    choice: ProtocolChoice,
) -> Result<UsedProtocol, ToplevelEventError> {
    let zwlr_usable = globals.iter().any(|g| {
        g.interface == ZwlrForeignToplevelManagerV1::interface().name
            && g.version >= ZWLR_MIN_VERSION
    });
    let ext_usable = globals
        .iter()
        .any(|g| g.interface == ExtForeignToplevelListV1::interface().name);

    match choice {
        ProtocolChoice::Zwlr => {
            if zwlr_usable {
                Ok(UsedProtocol::Zwlr)
            } else {
                Err(ToplevelEventError::ProtocolUnsupported(
                    "zwlr_foreign_toplevel_manager_v1 (version 3 or later)",
                ))
            }
        }
        ProtocolChoice::Ext => {
            if ext_usable {
                Ok(UsedProtocol::Ext)
            } else {
                Err(ToplevelEventError::ProtocolUnsupported(
                    "ext_foreign_toplevel_list_v1",
                ))
            }
        }
        ProtocolChoice::Auto => {
            if ext_usable {
                Ok(UsedProtocol::Ext)
            } else if zwlr_usable {
                Ok(UsedProtocol::Zwlr)
            } else {
                Err(ToplevelEventError::NoProtocol)
            }
        }
    }
}

/// Decode a zwlr state array: native-endian u32 values, one per asserted
/// state, unknown values skipped.
pub(crate) fn parse_state_array(bytes: &[u8]) -> StateFlags {
    let mut states = StateFlags::empty();
    for chunk in bytes.chunks_exact(4) {
        let value = u32::from_ne_bytes(chunk.try_into().unwrap());
        match value {
            0 => states |= StateFlags::MAXIMIZED,
            1 => states |= StateFlags::MINIMIZED,
            2 => states |= StateFlags::ACTIVATED,
            3 => states |= StateFlags::FULLSCREEN,
            other => log::debug!("ignoring unknown toplevel state value {other}"),
        }
    }
    states
}

impl Dispatch<ZwlrForeignToplevelManagerV1, ()> for TrackerState {
    fn event(
        state: &mut Self,
        _proxy: &ZwlrForeignToplevelManagerV1,
        event: zwlr_foreign_toplevel_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_foreign_toplevel_manager_v1::Event::Toplevel { toplevel } => {
                if state.used_protocol != UsedProtocol::Zwlr {
                    log::warn!("toplevel announced on the unselected zwlr protocol; dropping");
                    toplevel.destroy();
                    return;
                }
                let key = toplevel.id().protocol_id();
                state.registry.create(key, ToplevelHandle::Zwlr(toplevel));
            }
            zwlr_foreign_toplevel_manager_v1::Event::Finished => {
                log::info!("compositor finished the zwlr toplevel manager");
                state.finish();
            }
            _ => {}
        }
    }

    fn event_created_child(
        opcode: u16,
        qhandle: &QueueHandle<Self>,
    ) -> std::sync::Arc<dyn wayland_client::backend::ObjectData> {
        match opcode {
            // toplevel event (opcode 0)
            0 => qhandle.make_data::<ZwlrForeignToplevelHandleV1, _>(()),
            _ => panic!("Unknown opcode in event_created_child: {}", opcode),
        }
    }
}

impl Dispatch<ZwlrForeignToplevelHandleV1, ()> for TrackerState {
    fn event(
        state: &mut Self,
        proxy: &ZwlrForeignToplevelHandleV1,
        event: zwlr_foreign_toplevel_handle_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        let key = proxy.id().protocol_id();
        match event {
            zwlr_foreign_toplevel_handle_v1::Event::Title { title } => {
                state.registry.set_title(key, title);
            }
            zwlr_foreign_toplevel_handle_v1::Event::AppId { app_id } => {
                state.registry.set_app_id(key, app_id);
            }
            zwlr_foreign_toplevel_handle_v1::Event::State { state: array } => {
                state.registry.set_state(key, parse_state_array(&array));
            }
            zwlr_foreign_toplevel_handle_v1::Event::Done => {
                state.registry.mark_done(key);
            }
            zwlr_foreign_toplevel_handle_v1::Event::Closed => {
                // A snapshot run only cares about what existed at the
                // barrier; closures are someone else's news.
                if state.streaming() {
                    state.registry.destroy(key);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<ExtForeignToplevelListV1, ()> for TrackerState {
    fn event(
        state: &mut Self,
        _proxy: &ExtForeignToplevelListV1,
        event: ext_foreign_toplevel_list_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        match event {
            ext_foreign_toplevel_list_v1::Event::Toplevel { toplevel } => {
                if state.used_protocol != UsedProtocol::Ext {
                    log::warn!("toplevel announced on the unselected ext protocol; dropping");
                    toplevel.destroy();
                    return;
                }
                let key = toplevel.id().protocol_id();
                state.registry.create(key, ToplevelHandle::Ext(toplevel));
            }
            ext_foreign_toplevel_list_v1::Event::Finished => {
                log::info!("compositor finished the ext toplevel list");
                state.finish();
            }
            _ => {}
        }
    }

    fn event_created_child(
        opcode: u16,
        qhandle: &QueueHandle<Self>,
    ) -> std::sync::Arc<dyn wayland_client::backend::ObjectData> {
        match opcode {
            // toplevel event (opcode 0)
            0 => qhandle.make_data::<ExtForeignToplevelHandleV1, _>(()),
            _ => panic!("Unknown opcode in event_created_child: {}", opcode),
        }
    }
}

impl Dispatch<ExtForeignToplevelHandleV1, ()> for TrackerState {
    fn event(
        state: &mut Self,
        proxy: &ExtForeignToplevelHandleV1,
        event: ext_foreign_toplevel_handle_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        let key = proxy.id().protocol_id();
        match event {
            ext_foreign_toplevel_handle_v1::Event::Title { title } => {
                state.registry.set_title(key, title);
            }
            ext_foreign_toplevel_handle_v1::Event::AppId { app_id } => {
                state.registry.set_app_id(key, app_id);
            }
            ext_foreign_toplevel_handle_v1::Event::Identifier { identifier } => {
                state.registry.set_identifier(key, identifier);
            }
            ext_foreign_toplevel_handle_v1::Event::Done => {
                state.registry.mark_done(key);
            }
            ext_foreign_toplevel_handle_v1::Event::Closed => {
                if state.streaming() {
                    state.registry.destroy(key);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(interface: &str, version: u32) -> Global {
        Global {
            name: 1,
            interface: interface.into(),
            version,
        }
    }

    const ZWLR: &str = "zwlr_foreign_toplevel_manager_v1";
    const EXT: &str = "ext_foreign_toplevel_list_v1";

    #[test]
    fn auto_selects_the_only_usable_protocol() {
        let legacy = [global(ZWLR, 3)];
        assert_eq!(
            select_protocol(&legacy, ProtocolChoice::Auto).unwrap(),
            UsedProtocol::Zwlr
        );

        let standard = [global(EXT, 1)];
        assert_eq!(
            select_protocol(&standard, ProtocolChoice::Auto).unwrap(),
            UsedProtocol::Ext
        );
    }

    #[test]
    fn auto_prefers_ext_when_both_are_present() {
        let both = [global(ZWLR, 4), global(EXT, 1)];
        assert_eq!(
            select_protocol(&both, ProtocolChoice::Auto).unwrap(),
            UsedProtocol::Ext
        );
    }

    #[test]
    fn old_zwlr_versions_are_unusable() {
        let old = [global(ZWLR, 2)];
        assert!(matches!(
            select_protocol(&old, ProtocolChoice::Auto),
            Err(ToplevelEventError::NoProtocol)
        ));
        assert!(matches!(
            select_protocol(&old, ProtocolChoice::Zwlr),
            Err(ToplevelEventError::ProtocolUnsupported(_))
        ));
    }

    #[test]
    fn forcing_an_absent_protocol_fails() {
        let legacy = [global(ZWLR, 3)];
        assert!(matches!(
            select_protocol(&legacy, ProtocolChoice::Ext),
            Err(ToplevelEventError::ProtocolUnsupported(_))
        ));

        let standard = [global(EXT, 1)];
        assert!(matches!(
            select_protocol(&standard, ProtocolChoice::Zwlr),
            Err(ToplevelEventError::ProtocolUnsupported(_))
        ));
        assert_eq!(
            select_protocol(&standard, ProtocolChoice::Ext).unwrap(),
            UsedProtocol::Ext
        );
    }

    #[test]
    fn no_protocol_at_all_fails() {
        let none = [global("wl_compositor", 6)];
        assert!(matches!(
            select_protocol(&none, ProtocolChoice::Auto),
            Err(ToplevelEventError::NoProtocol)
        ));
    }

    #[test]
    fn capabilities_follow_the_protocol() {
        let zwlr = Capabilities::for_protocol(UsedProtocol::Zwlr);
        assert!(zwlr.supports_state());
        assert!(!zwlr.contains(Capabilities::IDENTIFIER));

        let ext = Capabilities::for_protocol(UsedProtocol::Ext);
        assert!(!ext.supports_state());
        assert!(ext.contains(Capabilities::IDENTIFIER));
    }

    #[test]
    fn state_array_decodes_native_endian_u32s() {
        let mut bytes = Vec::new();
        for value in [2u32, 0, 7] {
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        assert_eq!(
            parse_state_array(&bytes),
            StateFlags::ACTIVATED | StateFlags::MAXIMIZED
        );
        assert_eq!(parse_state_array(&[]), StateFlags::empty());
    }
}
