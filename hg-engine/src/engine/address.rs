//! Addresses and their text form.
//!
//! [`Engine::addr_to_string`] follows the usual two-call sizing protocol:
//! call once without a buffer to learn the length (terminating NUL
//! included), allocate exactly that, call again to fill. The returned length
//! never counts past the NUL and the fill never writes past it.
//!
//! [`Engine::addr_to_text`] is the owned-string shortcut, and
//! [`resolve_self`] runs the whole self-address sequence with a canary byte
//! after the buffer, treating any mismatch as a consistency failure.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Engine, EngineShared};
use crate::error::{EngineError, Result};
use crate::plugin::NaAddr;

/// Byte placed one past the fill buffer to detect overruns.
const CANARY: u8 = b'x';

/// An endpoint address obtained from an engine.
///
/// Must be released with [`Engine::addr_free`] before the engine is
/// finalized. Dropping it also releases it.
pub struct Address {
    engine: Arc<EngineShared>,
    na: NaAddr,
    sm: Option<NaAddr>,
}

impl Address {
    fn new(engine: Arc<EngineShared>, na: NaAddr, sm: Option<NaAddr>) -> Self {
        engine.live_addresses.fetch_add(1, Ordering::AcqRel);
        Self { engine, na, sm }
    }

    pub fn na_addr(&self) -> &NaAddr {
        &self.na
    }

    /// Shared-memory route for same-host peers, present with `auto_sm`.
    pub fn sm_addr(&self) -> Option<&NaAddr> {
        self.sm.as_ref()
    }
}

impl Drop for Address {
    fn drop(&mut self) {
        self.engine.live_addresses.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("engine", &self.engine.id)
            .field("na", &self.na.uri())
            .field("sm", &self.sm.as_ref().map(NaAddr::uri))
            .finish()
    }
}

impl Engine {
    /// Look up the address this engine can be reached at.
    pub fn addr_self(&self) -> Result<Address> {
        let na = self
            .shared
            .na
            .addr_self()
            .map_err(|e| EngineError::Address(format!("self address lookup: {e}")))?;
        let sm = match &self.shared.sm {
            Some(sm) => Some(
                sm.addr_self()
                    .map_err(|e| EngineError::Address(format!("sm self address lookup: {e}")))?,
            ),
            None => None,
        };
        self.shared.stats.record_address_resolved();
        debug!(na = na.uri(), "Self address resolved");
        Ok(Address::new(self.shared.clone(), na, sm))
    }

    fn check_owner(&self, addr: &Address) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &addr.engine) {
            return Err(EngineError::Address(format!(
                "address belongs to engine {}, not engine {}",
                addr.engine.id, self.shared.id
            )));
        }
        Ok(())
    }

    fn render(&self, addr: &Address) -> Result<String> {
        self.check_owner(addr)?;
        let na = self
            .shared
            .na
            .addr_to_string(&addr.na)
            .map_err(|e| EngineError::Address(format!("address to string: {e}")))?;
        let text = match (&self.shared.sm, &addr.sm) {
            (Some(class), Some(sm)) => {
                let sm = class
                    .addr_to_string(sm)
                    .map_err(|e| EngineError::Address(format!("sm address to string: {e}")))?;
                format!("{sm}#{na}")
            }
            _ => na,
        };
        if text.is_empty() {
            return Err(EngineError::Address("plugin rendered an empty address".into()));
        }
        if text.as_bytes().contains(&0) {
            return Err(EngineError::Consistency(format!(
                "rendered address contains a NUL byte: {:?}",
                text
            )));
        }
        Ok(text)
    }

    /// Two-phase address rendering.
    ///
    /// With no buffer (or an empty one) returns the length needed, NUL
    /// included. With a buffer of at least that length, writes the text
    /// followed by NUL and returns the same length. Bytes past the returned
    /// length are never touched.
    pub fn addr_to_string(&self, buf: Option<&mut [u8]>, addr: &Address) -> Result<usize> {
        let text = self.render(addr)?;
        let needed = text.len() + 1;
        match buf {
            None => Ok(needed),
            Some(buf) if buf.is_empty() => Ok(needed),
            Some(buf) => {
                if buf.len() < needed {
                    return Err(EngineError::Address(format!(
                        "buffer too small: need {needed} bytes, got {}",
                        buf.len()
                    )));
                }
                buf[..text.len()].copy_from_slice(text.as_bytes());
                buf[text.len()] = 0;
                Ok(needed)
            }
        }
    }

    /// Render an address into an owned string.
    pub fn addr_to_text(&self, addr: &Address) -> Result<String> {
        self.render(addr)
    }

    /// Release an address. Fails if it belongs to a different engine.
    pub fn addr_free(&self, addr: Address) -> Result<()> {
        self.check_owner(&addr)?;
        debug!(na = addr.na.uri(), "Address released");
        drop(addr);
        Ok(())
    }
}

/// Result of [`resolve_self`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// Address text without the terminator.
    pub text: String,
    /// Buffer size the size query asked for (NUL included).
    pub buf_size: usize,
}

/// Resolve the engine's self address to text through the size-then-fill
/// protocol and release the address again.
///
/// A canary byte is placed right after the fill buffer; a changed canary, a
/// missing terminator or a length that moved between the two calls is an
/// [`EngineError::Consistency`] failure.
pub fn resolve_self(engine: &Engine) -> Result<ResolvedAddress> {
    let addr = engine.addr_self()?;

    let size = engine.addr_to_string(None, &addr)?;
    if size < 1 {
        return Err(EngineError::Consistency(format!("bad address buffer size {size}")));
    }
    debug!(size, "Address buffer size requested");

    let mut buf = vec![0u8; size + 1];
    buf[size] = CANARY;
    let filled = engine.addr_to_string(Some(&mut buf[..size]), &addr)?;
    check_filled(&buf, size, filled)?;

    let text = String::from_utf8(buf[..size - 1].to_vec())
        .map_err(|e| EngineError::Consistency(format!("address text is not UTF-8: {e}")))?;
    engine.addr_free(addr)?;

    info!(address = %text, "Self address");
    Ok(ResolvedAddress {
        text,
        buf_size: size,
    })
}

fn check_filled(buf: &[u8], size: usize, filled: usize) -> Result<()> {
    if filled != size {
        return Err(EngineError::Consistency(format!(
            "address length changed between calls: {size} then {filled}"
        )));
    }
    if buf[size] != CANARY {
        return Err(EngineError::Consistency("address buffer overrun (canary modified)".into()));
    }
    if buf[size - 1] != 0 {
        return Err(EngineError::Consistency("address text not NUL-terminated".into()));
    }
    Ok(())
}
