//! Device filter rules
//!
//! A filter is an ordered list of rules, each matching on device class,
//! vendor id, product id and device version (bcdDevice), with any field
//! optionally a wildcard. The first rule that matches decides; a device no
//! rule matches is denied.
//!
//! The textual form joins rules with `|` and fields with `,`:
//!
//! ```text
//! class,vendor,product,version,allow|class,vendor,product,version,allow
//! ```
//!
//! Numeric fields are decimal or `0x`-prefixed hex, `-1` is the wildcard and
//! `allow` is `0` or `1`. For example `0x03,-1,-1,-1,0|-1,-1,-1,-1,1` denies
//! HID devices and allows everything else.

use common::usb_types::{CLASS_MISC, CLASS_PER_INTERFACE, DeviceDescriptor};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default auto-connect filter: everything except HID devices
pub const DEFAULT_AUTO_CONNECT_FILTER: &str = "0x03,-1,-1,-1,0|-1,-1,-1,-1,1";

/// Filter string parse failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    #[error("rule {rule}: expected 5 fields, found {found}")]
    FieldCount { rule: usize, found: usize },

    #[error("rule {rule}: invalid {field} value '{value}'")]
    InvalidNumber {
        rule: usize,
        field: &'static str,
        value: String,
    },

    #[error("rule {rule}: {field} value {value} out of range")]
    OutOfRange {
        rule: usize,
        field: &'static str,
        value: i64,
    },

    #[error("rule {rule}: allow must be 0 or 1, got '{value}'")]
    InvalidAllow { rule: usize, value: String },
}

/// A single filter rule; `None` fields match anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRule {
    pub class: Option<u8>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub bcd_device: Option<u16>,
    pub allow: bool,
}

impl FilterRule {
    /// Rule matching every device
    pub const fn any(allow: bool) -> Self {
        Self {
            class: None,
            vendor_id: None,
            product_id: None,
            bcd_device: None,
            allow,
        }
    }

    fn matches_fields(&self, class: u8, vendor_id: u16, product_id: u16, bcd_device: u16) -> bool {
        field_matches(self.class, class)
            && field_matches(self.vendor_id, vendor_id)
            && field_matches(self.product_id, product_id)
            && field_matches(self.bcd_device, bcd_device)
    }
}

fn field_matches<T: PartialEq>(rule: Option<T>, value: T) -> bool {
    rule.is_none_or(|expected| expected == value)
}

/// Ordered rule set; first match wins, default deny
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRules {
    rules: Vec<FilterRule>,
}

impl FilterRules {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The decision of the first rule matching the given fields, if any
    fn first_match(&self, class: u8, vendor_id: u16, product_id: u16, bcd_device: u16) -> Option<bool> {
        self.rules
            .iter()
            .find(|rule| rule.matches_fields(class, vendor_id, product_id, bcd_device))
            .map(|rule| rule.allow)
    }

    /// Evaluate a device on its device class
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        self.first_match(
            device.class,
            device.vendor_id,
            device.product_id,
            device.bcd_device,
        )
        .unwrap_or(false)
    }

    /// Evaluate a device including its interface classes
    ///
    /// Composite devices (class 0x00 or 0xef) are judged by their interface
    /// classes; other devices by their device class and then each interface.
    /// Every evaluation must allow the device.
    pub fn check_device(&self, device: &DeviceDescriptor) -> bool {
        let composite = matches!(device.class, CLASS_PER_INTERFACE | CLASS_MISC);
        if composite && device.interface_classes.is_empty() {
            return self.matches(device);
        }
        if !composite && !self.matches(device) {
            return false;
        }

        device.interface_classes.iter().all(|&class| {
            self.first_match(class, device.vendor_id, device.product_id, device.bcd_device)
                .unwrap_or(false)
        })
    }
}

impl FromIterator<FilterRule> for FilterRules {
    fn from_iter<I: IntoIterator<Item = FilterRule>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

fn parse_field(rule: usize, field: &'static str, text: &str, max: i64) -> Result<Option<i64>, FilterParseError> {
    let text = text.trim();
    let parsed = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else {
        text.parse::<i64>()
    };

    let value = parsed.map_err(|_| FilterParseError::InvalidNumber {
        rule,
        field,
        value: text.to_string(),
    })?;

    match value {
        -1 => Ok(None),
        v if (0..=max).contains(&v) => Ok(Some(v)),
        v => Err(FilterParseError::OutOfRange {
            rule,
            field,
            value: v,
        }),
    }
}

fn parse_rule(rule: usize, text: &str) -> Result<FilterRule, FilterParseError> {
    let fields: Vec<&str> = text.split(',').collect();
    let [class, vendor, product, version, allow] = fields.as_slice() else {
        return Err(FilterParseError::FieldCount {
            rule,
            found: fields.len(),
        });
    };

    let allow = match allow.trim() {
        "0" => false,
        "1" => true,
        other => {
            return Err(FilterParseError::InvalidAllow {
                rule,
                value: other.to_string(),
            });
        }
    };

    Ok(FilterRule {
        class: parse_field(rule, "class", class, 0xff)?.map(|v| v as u8),
        vendor_id: parse_field(rule, "vendor", vendor, 0xffff)?.map(|v| v as u16),
        product_id: parse_field(rule, "product", product, 0xffff)?.map(|v| v as u16),
        bcd_device: parse_field(rule, "version", version, 0xffff)?.map(|v| v as u16),
        allow,
    })
}

impl FromStr for FilterRules {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }

        s.split('|')
            .enumerate()
            .map(|(index, rule)| parse_rule(index, rule))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }
}

fn write_field<T: fmt::LowerHex>(
    f: &mut fmt::Formatter<'_>,
    field: Option<T>,
    width: usize,
) -> fmt::Result {
    match field {
        Some(v) => write!(f, "{:#0width$x},", v, width = width),
        None => write!(f, "-1,"),
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_field(f, self.class, 4)?;
        write_field(f, self.vendor_id, 6)?;
        write_field(f, self.product_id, 6)?;
        write_field(f, self.bcd_device, 6)?;
        write!(f, "{}", u8::from(self.allow))
    }
}

impl fmt::Display for FilterRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{}", rule)?;
        }
        Ok(())
    }
}
