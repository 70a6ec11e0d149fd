use tracing::{debug, warn};
use vdsync_vdisplay::{Mode, ModeRequest, ModeSource};

/// Environment names for each component, preferred spelling first.
pub const WIDTH_VARS: [&str; 2] = ["CLIENT_WIDTH", "SUNSHINE_CLIENT_WIDTH"];
pub const HEIGHT_VARS: [&str; 2] = ["CLIENT_HEIGHT", "SUNSHINE_CLIENT_HEIGHT"];
pub const REFRESH_VARS: [&str; 2] = ["CLIENT_REFRESH_HZ", "SUNSHINE_CLIENT_FPS"];

/// Build the client's request from environment-style lookups.
///
/// Fails closed: if any component is missing, unparseable or zero, the whole
/// `default` triple is used and the request is marked [`ModeSource::Default`].
pub fn request_from<F>(lookup: F, default: Mode) -> ModeRequest
where
    F: Fn(&str) -> Option<String>,
{
    let component = |names: &[&str]| -> Option<u32> {
        let (name, raw) = names
            .iter()
            .find_map(|name| lookup(*name).map(|value| (*name, value)))?;
        match raw.trim().parse::<u32>() {
            Ok(v) if v > 0 => Some(v),
            _ => {
                warn!(name, value = %raw, "Ignoring unparseable client mode component");
                None
            }
        }
    };

    match (component(&WIDTH_VARS), component(&HEIGHT_VARS), component(&REFRESH_VARS)) {
        (Some(w), Some(h), Some(r)) => {
            let mode = Mode::new(w, h, r);
            debug!(%mode, "Client declared mode");
            ModeRequest {
                mode,
                source: ModeSource::Client,
            }
        }
        _ => {
            debug!(mode = %default, "Client mode incomplete, using default");
            ModeRequest {
                mode: default,
                source: ModeSource::Default,
            }
        }
    }
}
