use std::fmt;

use cadenza_graph::{PortFlags, PortRange};
use serde::{Deserialize, Serialize};

use crate::ids::{PluginId, SendId, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FaderControl {
    Amp,
    Balance,
    Mute,
}

impl FaderControl {
    pub fn range(self) -> (PortRange, PortFlags) {
        match self {
            FaderControl::Amp => (PortRange::new(0.0, 2.0, 1.0), PortFlags::automatable()),
            FaderControl::Balance => (PortRange::bipolar(), PortFlags::automatable()),
            FaderControl::Mute => (PortRange::unit(), PortFlags::toggle()),
        }
    }
}

/// An automatable control of the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamAddress {
    Fader { track: TrackId, control: FaderControl },
    Send { send: SendId },
    Plugin { plugin: PluginId, index: u32 },
    Macro { track: TrackId, index: u8 },
}

impl ParamAddress {
    pub fn amp(track: TrackId) -> Self {
        ParamAddress::Fader {
            track,
            control: FaderControl::Amp,
        }
    }

    pub fn balance(track: TrackId) -> Self {
        ParamAddress::Fader {
            track,
            control: FaderControl::Balance,
        }
    }

    pub fn mute(track: TrackId) -> Self {
        ParamAddress::Fader {
            track,
            control: FaderControl::Mute,
        }
    }

    pub fn plugin(plugin: PluginId, index: u32) -> Self {
        ParamAddress::Plugin { plugin, index }
    }
}

impl fmt::Display for ParamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamAddress::Fader { track, control } => write!(f, "{track}/fader/{control:?}"),
            ParamAddress::Send { send } => write!(f, "{send}/amount"),
            ParamAddress::Plugin { plugin, index } => write!(f, "{plugin}/param/{index}"),
            ParamAddress::Macro { track, index } => write!(f, "{track}/macro/{index}"),
        }
    }
}
