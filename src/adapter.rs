//! Carrier adapter contract and tracking-number grammars.
//!
//! An adapter covers one carrier: it names the courier code it owns, claims
//! any universal code families it serves (UPU S10 for postal operators), says
//! which tracking-number grammars it recognizes, and performs the terminal
//! `track` call. Response parsing is the adapter's private business; the
//! pipeline only sees the normalized [`TrackingResult`].

use async_trait::async_trait;

use crate::error::TrackingError;
use crate::model::TrackingResult;

/// Code for the UPU S10 cross-carrier tracking-number family.
pub const UNIVERSAL_S10: &str = "s10";

/// Per-carrier component implementing the common tracking contract.
#[async_trait]
pub trait CourierAdapter: Send + Sync {
    /// Display name ("United Parcel Service").
    fn name(&self) -> &str;

    /// Stable courier code ("ups"); the key for all per-key pipeline state.
    fn code(&self) -> &str;

    /// Universal code families this adapter declares ownership of (e.g.
    /// [`UNIVERSAL_S10`] for a postal operator). Detection maps a universal
    /// match back to the owning adapter.
    fn universal_codes(&self) -> &[&str] {
        &[]
    }

    /// Probe the tracking number against this adapter's grammars. Returns the
    /// matched code: the adapter's own code, or a universal code it relays.
    fn detect(&self, tracking_number: &str) -> Option<&str>;

    /// The terminal carrier call.
    async fn track(&self, tracking_number: &str) -> Result<TrackingResult, TrackingError>;
}

/// Format/checksum grammars shared by adapters.
pub mod grammar {
    /// UPU S10: two letters, nine digits (eight serial + check digit), two
    /// letters of ISO country code, e.g. `RR123456785CN`.
    pub fn is_s10(tracking_number: &str) -> bool {
        let bytes = tracking_number.as_bytes();
        if bytes.len() != 13 {
            return false;
        }
        if !bytes[..2].iter().chain(&bytes[11..]).all(|b| b.is_ascii_uppercase()) {
            return false;
        }
        let mut digits = [0u8; 9];
        for (slot, b) in digits.iter_mut().zip(&bytes[2..11]) {
            if !b.is_ascii_digit() {
                return false;
            }
            *slot = *b - b'0';
        }
        s10_check_digit(&digits[..8]) == digits[8]
    }

    /// S10 check digit over the eight serial digits, weights 8 6 4 2 3 5 9 7;
    /// `11 - (sum mod 11)`, with 10 mapped to 0 and 11 mapped to 5.
    pub fn s10_check_digit(serial: &[u8]) -> u8 {
        const WEIGHTS: [u32; 8] = [8, 6, 4, 2, 3, 5, 9, 7];
        let sum: u32 =
            serial.iter().zip(WEIGHTS).map(|(d, w)| u32::from(*d) * w).sum();
        match 11 - (sum % 11) {
            10 => 0,
            11 => 5,
            c => c as u8,
        }
    }

    /// Luhn mod-10 check over an all-digit string (common for parcel-carrier
    /// numeric formats).
    pub fn is_luhn_valid(tracking_number: &str) -> bool {
        let bytes = tracking_number.as_bytes();
        if bytes.is_empty() || !bytes.iter().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let sum: u32 = bytes
            .iter()
            .rev()
            .enumerate()
            .map(|(i, b)| {
                let d = u32::from(b - b'0');
                if i % 2 == 1 {
                    let doubled = d * 2;
                    if doubled > 9 {
                        doubled - 9
                    } else {
                        doubled
                    }
                } else {
                    d
                }
            })
            .sum();
        sum % 10 == 0
    }
}
