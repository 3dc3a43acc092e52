use crate::VdevError;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Option values of one device, positionally matching the driver's
/// [`option_keys`](crate::VirtualPciDriver::option_keys).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverOptions {
    keys: &'static [&'static str],
    values: Vec<Option<String>>,
}

impl DriverOptions {
    /// Values beyond the end of `raw` are absent.
    ///
    /// # Errors
    /// [`VdevError::TooManyOptions`] if `raw` has more entries than `keys`.
    pub fn new(
        driver: &'static str,
        keys: &'static [&'static str],
        raw: &[Option<&str>],
    ) -> Result<Self, VdevError> {
        if raw.len() > keys.len() {
            return Err(VdevError::TooManyOptions {
                driver,
                accepted: keys.len(),
                given: raw.len(),
            });
        }
        let values = (0..keys.len())
            .map(|i| raw.get(i).copied().flatten().map(ToString::to_string))
            .collect();
        Ok(Self { keys, values })
    }

    #[must_use]
    pub fn key(&self, i: usize) -> Option<&'static str> {
        self.keys.get(i).copied()
    }

    #[must_use]
    pub fn get(&self, i: usize) -> Option<&str> {
        self.values.get(i)?.as_deref()
    }

    /// The value at `i` as a boolean; `None` if absent.
    ///
    /// Accepts `1`/`0`, `yes`/`no`, `on`/`off`, `true`/`false`, ignoring
    /// ASCII case.
    ///
    /// # Errors
    /// [`VdevError::InvalidBool`] for anything else.
    pub fn get_bool(&self, i: usize) -> Result<Option<bool>, VdevError> {
        let Some(value) = self.get(i) else {
            return Ok(None);
        };
        let is = |words: [&str; 4]| words.iter().any(|w| value.eq_ignore_ascii_case(w));
        if is(["1", "yes", "on", "true"]) {
            Ok(Some(true))
        } else if is(["0", "no", "off", "false"]) {
            Ok(Some(false))
        } else {
            Err(VdevError::InvalidBool {
                key: self.key(i).unwrap_or("?"),
                value: value.to_string(),
            })
        }
    }
}
