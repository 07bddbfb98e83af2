//! Per-device arguments given by the user, e.g. `keep_ovlan=1,force_link_up=1`.

/// Keep the outer VLAN tag of received packets.
pub const DEVARG_KEEP_OVLAN: &str = "keep_ovlan";
/// Report the link as up as soon as the port is started.
pub const DEVARG_FORCE_LINK_UP: &str = "force_link_up";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevArgs {
    pub keep_ovlan: bool,
    pub force_link_up: bool,
}

impl DevArgs {
    /// Parse a comma separated list of `key=value` pairs.
    ///
    /// An argument is only enabled if its value is exactly `1`. Unknown
    /// keys are ignored, a malformed list enables nothing.
    pub fn parse(args: &str) -> Self {
        let mut parsed = Self::default();
        if args.trim().is_empty() {
            return parsed;
        }
        let mut pairs = alloc::vec::Vec::new();
        for pair in args.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                warn!("ignoring malformed device arguments {args:?}");
                return Self::default();
            };
            pairs.push((key.trim(), value.trim()));
        }
        for (key, value) in pairs {
            let enabled = value == "1";
            match key {
                DEVARG_KEEP_OVLAN => parsed.keep_ovlan = enabled,
                DEVARG_FORCE_LINK_UP => parsed.force_link_up = enabled,
                _ => debug!("ignoring unknown device argument {key}"),
            }
        }
        parsed
    }
}
