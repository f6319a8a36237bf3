// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use std::fmt;

use aya::programs::XdpFlags;
use serde::{Deserialize, Serialize};

use crate::errors::ParseError;

/// Run priority assigned to a program whose object carries no run config.
pub const DEFAULT_RUN_PRIO: u32 = 50;

/// Chain-call mask assigned to a program whose object carries no run
/// config: continue the chain on `XDP_PASS` only.
pub const DEFAULT_CHAIN_CALL_ACTIONS: u32 = 1 << (XdpAction::Pass as u32);

/// XDP program return codes, in kernel order.
///
/// The textual names are the exact `XDP_*` forms; they double as member
/// names in the run-config metadata embedded in program objects.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum XdpAction {
    Aborted = 0,
    Drop,
    Pass,
    Tx,
    Redirect,
}

impl XdpAction {
    pub(crate) const ALL: [XdpAction; 5] = [
        XdpAction::Aborted,
        XdpAction::Drop,
        XdpAction::Pass,
        XdpAction::Tx,
        XdpAction::Redirect,
    ];
}

impl TryFrom<&str> for XdpAction {
    type Error = ParseError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(match value {
            "XDP_ABORTED" => XdpAction::Aborted,
            "XDP_DROP" => XdpAction::Drop,
            "XDP_PASS" => XdpAction::Pass,
            "XDP_TX" => XdpAction::Tx,
            "XDP_REDIRECT" => XdpAction::Redirect,
            action => {
                return Err(ParseError::InvalidAction {
                    action: action.to_string(),
                });
            }
        })
    }
}

impl TryFrom<u32> for XdpAction {
    type Error = ParseError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => XdpAction::Aborted,
            1 => XdpAction::Drop,
            2 => XdpAction::Pass,
            3 => XdpAction::Tx,
            4 => XdpAction::Redirect,
            action => {
                return Err(ParseError::InvalidAction {
                    action: action.to_string(),
                });
            }
        })
    }
}

impl fmt::Display for XdpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self {
            XdpAction::Aborted => "XDP_ABORTED",
            XdpAction::Drop => "XDP_DROP",
            XdpAction::Pass => "XDP_PASS",
            XdpAction::Tx => "XDP_TX",
            XdpAction::Redirect => "XDP_REDIRECT",
        };
        write!(f, "{v}")
    }
}

/// The set of actions on which the dispatcher continues down the chain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct XdpProceedOn(Vec<XdpAction>);

impl Default for XdpProceedOn {
    fn default() -> Self {
        XdpProceedOn(vec![XdpAction::Pass])
    }
}

impl FromIterator<XdpAction> for XdpProceedOn {
    fn from_iter<I: IntoIterator<Item = XdpAction>>(iter: I) -> Self {
        XdpProceedOn(iter.into_iter().collect())
    }
}

impl XdpProceedOn {
    pub fn from_strings<T: AsRef<[String]>>(values: T) -> Result<XdpProceedOn, ParseError> {
        let entries = values.as_ref();
        let mut res = vec![];
        for e in entries {
            res.push(e.as_str().try_into()?)
        }
        Ok(XdpProceedOn(res))
    }

    pub fn from_mask(mask: u32) -> XdpProceedOn {
        let mut res = vec![];
        for action in XdpAction::ALL {
            if mask & (1 << action as u32) != 0 {
                res.push(action);
            }
        }
        XdpProceedOn(res)
    }

    pub fn mask(&self) -> u32 {
        let mut proceed_on_mask: u32 = 0;
        for action in self.0.iter() {
            proceed_on_mask |= 1 << *action as u32;
        }
        proceed_on_mask
    }

    pub fn contains(&self, action: XdpAction) -> bool {
        self.0.contains(&action)
    }
}

impl fmt::Display for XdpProceedOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<String> = self.0.iter().map(|a| a.to_string()).collect();
        write!(f, "{}", actions.join(", "))
    }
}

/// Attach mode requested for the interface hook. `Unspec` lets the
/// kernel pick; `Drv` is what diagnostics call native mode.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    Unspec,
    Skb,
    Drv,
    Hw,
}

impl XdpMode {
    pub(crate) fn as_flags(&self) -> XdpFlags {
        match self {
            XdpMode::Unspec => XdpFlags::empty(),
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Drv => XdpFlags::DRV_MODE,
            XdpMode::Hw => XdpFlags::HW_MODE,
        }
    }
}

impl TryFrom<u32> for XdpMode {
    type Error = ParseError;

    fn try_from(mode: u32) -> Result<Self, Self::Error> {
        match mode {
            0 => Ok(XdpMode::Unspec),
            1 => Ok(XdpMode::Skb),
            2 => Ok(XdpMode::Drv),
            3 => Ok(XdpMode::Hw),
            _ => Err(ParseError::InvalidXdpMode {
                mode: mode.to_string(),
            }),
        }
    }
}

impl fmt::Display for XdpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XdpMode::Unspec => write!(f, "unspec"),
            XdpMode::Skb => write!(f, "skb"),
            XdpMode::Drv => write!(f, "drv"),
            XdpMode::Hw => write!(f, "hw"),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_action_names_are_exact() {
        assert_eq!(XdpAction::try_from("XDP_PASS").unwrap(), XdpAction::Pass);
        assert_eq!(XdpAction::Aborted.to_string(), "XDP_ABORTED");
        assert_eq!(XdpAction::Redirect.to_string(), "XDP_REDIRECT");
        assert_matches!(
            XdpAction::try_from("xdp_pass"),
            Err(ParseError::InvalidAction { .. })
        );
        assert_matches!(
            XdpAction::try_from("XDP_PASS "),
            Err(ParseError::InvalidAction { .. })
        );
    }

    #[test]
    fn test_action_ordering() {
        for (i, action) in XdpAction::ALL.iter().enumerate() {
            assert_eq!(*action as u32, i as u32);
            assert_eq!(XdpAction::try_from(i as u32).unwrap(), *action);
        }
        assert_matches!(
            XdpAction::try_from(5u32),
            Err(ParseError::InvalidAction { .. })
        );
    }

    #[test]
    fn test_proceed_on_mask_round_trip() {
        let p = XdpProceedOn::from_strings(["XDP_PASS".to_string(), "XDP_DROP".to_string()])
            .expect("valid action names");
        assert_eq!(p.mask(), (1 << 2) | (1 << 1));
        assert_eq!(XdpProceedOn::from_mask(p.mask()), p);
    }

    #[test]
    fn test_proceed_on_default() {
        assert_eq!(XdpProceedOn::default().mask(), DEFAULT_CHAIN_CALL_ACTIONS);
        assert_eq!(DEFAULT_CHAIN_CALL_ACTIONS, 1 << 2);
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(XdpMode::Unspec.as_flags(), XdpFlags::empty());
        assert_eq!(XdpMode::Skb.as_flags(), XdpFlags::SKB_MODE);
        assert_eq!(XdpMode::Drv.as_flags(), XdpFlags::DRV_MODE);
        assert_eq!(XdpMode::Hw.as_flags(), XdpFlags::HW_MODE);
    }
}
