// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use aya_obj::btf::{Btf, BtfKind, BtfType, VarLinkage};
use log::debug;

use crate::{
    errors::XdpManError,
    types::{DEFAULT_CHAIN_CALL_ACTIONS, DEFAULT_RUN_PRIO, XdpAction},
};

/// Data section carrying the declarative run config of each program in
/// an object. The section holds one struct-typed variable per program,
/// named `_<program>`, whose members encode values in pointed-to array
/// lengths: `priority` carries the run priority, and members named
/// after an XDP action enable chain continuation for that action when
/// their length is non-zero.
pub(crate) const RUN_CONFIG_SECTION: &str = ".xdp_run_config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunConfig {
    pub(crate) priority: u32,
    pub(crate) chain_call_actions: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            priority: DEFAULT_RUN_PRIO,
            chain_call_actions: DEFAULT_CHAIN_CALL_ACTIONS,
        }
    }
}

/// Recovers the run config for `prog_name` from program BTF. Returns
/// [`XdpManError::NoRunConfig`] when the metadata simply isn't there,
/// which callers treat as "use defaults"; any other error means the
/// section exists but violates the encoding contract.
pub(crate) fn parse_run_config(btf: &Btf, prog_name: &str) -> Result<RunConfig, XdpManError> {
    let sec_id = btf
        .id_by_type_name_kind(RUN_CONFIG_SECTION, BtfKind::DataSec)
        .map_err(|_| XdpManError::NoRunConfig)?;
    let BtfType::DataSec(sec) = btf.type_by_id(sec_id)? else {
        return Err(XdpManError::NoRunConfig);
    };

    let var_name = format!("_{prog_name}");
    for entry in sec.entries.iter() {
        let BtfType::Var(var) = btf.type_by_id(entry.btf_type)? else {
            return Err(XdpManError::MalformedRunConfig(
                "run config section entry is not a variable".to_string(),
            ));
        };
        if btf.string_at(var.name_offset)? != var_name.as_str() {
            continue;
        }

        match var.linkage {
            VarLinkage::Global | VarLinkage::Static => {}
            _ => {
                return Err(XdpManError::MalformedRunConfig(format!(
                    "config variable {var_name} has unexpected linkage"
                )));
            }
        }

        let struct_id = btf.resolve_type(var.btf_type)?;
        let BtfType::Struct(st) = btf.type_by_id(struct_id)? else {
            return Err(XdpManError::MalformedRunConfig(format!(
                "config variable {var_name} is not a struct"
            )));
        };
        if st.size > entry.size {
            return Err(XdpManError::MalformedRunConfig(format!(
                "config struct for {prog_name} overruns its section entry"
            )));
        }

        let mut config = RunConfig::default();
        for member in st.members.iter() {
            let member_name = btf.string_at(member.name_offset)?;
            let count = pointed_array_len(btf, member.btf_type)?;
            if member_name == "priority" {
                config.priority = count;
            } else if let Ok(action) = XdpAction::try_from(&*member_name) {
                if count != 0 {
                    config.chain_call_actions |= 1 << action as u32;
                } else {
                    config.chain_call_actions &= !(1 << action as u32);
                }
            } else {
                return Err(XdpManError::MalformedRunConfig(format!(
                    "unknown run config member {member_name}"
                )));
            }
        }
        debug!(
            "run config for {prog_name}: prio {} chain mask {:#x}",
            config.priority, config.chain_call_actions
        );
        return Ok(config);
    }

    Err(XdpManError::NoRunConfig)
}

// Values are encoded as `type (*member)[N]`; N is the payload.
fn pointed_array_len(btf: &Btf, type_id: u32) -> Result<u32, XdpManError> {
    let ptr_id = btf.resolve_type(type_id)?;
    let BtfType::Ptr(ptr) = btf.type_by_id(ptr_id)? else {
        return Err(XdpManError::MalformedRunConfig(
            "run config member is not a pointer".to_string(),
        ));
    };
    let array_id = btf.resolve_type(ptr.btf_type)?;
    let BtfType::Array(array) = btf.type_by_id(array_id)? else {
        return Err(XdpManError::MalformedRunConfig(
            "run config member does not point at an array".to_string(),
        ));
    };
    Ok(array.array.len)
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use aya_obj::btf::{
        Array, BtfMember, DataSec, DataSecEntry, Int, IntEncoding, Ptr, Struct, Var,
    };

    use super::*;

    fn build_btf(
        prog_name: &str,
        members: &[(&str, u32)],
        linkage: VarLinkage,
        entry_size: Option<u32>,
    ) -> Btf {
        let mut btf = Btf::new();
        let int_name = btf.add_string("int");
        let int_id = btf.add_type(BtfType::Int(Int::new(int_name, 4, IntEncoding::Signed, 0)));

        let mut btf_members = vec![];
        let mut bit_offset = 0;
        for (name, count) in members {
            let array_id = btf.add_type(BtfType::Array(Array::new(0, int_id, int_id, *count)));
            let ptr_id = btf.add_type(BtfType::Ptr(Ptr::new(0, array_id)));
            let name_offset = btf.add_string(name);
            btf_members.push(BtfMember {
                name_offset,
                btf_type: ptr_id,
                offset: bit_offset,
            });
            bit_offset += 64;
        }

        let struct_size = (members.len() * 8) as u32;
        let struct_id = btf.add_type(BtfType::Struct(Struct::new(0, btf_members, struct_size)));
        let var_name = btf.add_string(&format!("_{prog_name}"));
        let var_id = btf.add_type(BtfType::Var(Var::new(var_name, struct_id, linkage)));
        let sec_name = btf.add_string(RUN_CONFIG_SECTION);
        let sec_size = entry_size.unwrap_or(struct_size);
        btf.add_type(BtfType::DataSec(DataSec::new(
            sec_name,
            vec![DataSecEntry {
                btf_type: var_id,
                offset: 0,
                size: sec_size,
            }],
            sec_size,
        )));
        btf
    }

    #[test]
    fn test_round_trip() {
        let btf = build_btf(
            "xdp_filter",
            &[("priority", 42), ("XDP_PASS", 1), ("XDP_DROP", 0)],
            VarLinkage::Global,
            None,
        );
        let config = parse_run_config(&btf, "xdp_filter").expect("config parses");
        assert_eq!(config.priority, 42);
        assert_eq!(config.chain_call_actions, 1 << (XdpAction::Pass as u32));
    }

    #[test]
    fn test_actions_set_and_clear() {
        let btf = build_btf(
            "xdp_filter",
            &[("XDP_DROP", 1), ("XDP_REDIRECT", 1), ("XDP_PASS", 0)],
            VarLinkage::Static,
            None,
        );
        let config = parse_run_config(&btf, "xdp_filter").expect("config parses");
        assert_eq!(config.priority, DEFAULT_RUN_PRIO);
        assert_eq!(
            config.chain_call_actions,
            (1 << (XdpAction::Drop as u32)) | (1 << (XdpAction::Redirect as u32))
        );
    }

    #[test]
    fn test_missing_section_is_no_config() {
        let btf = Btf::new();
        assert_matches!(
            parse_run_config(&btf, "xdp_filter"),
            Err(XdpManError::NoRunConfig)
        );
    }

    #[test]
    fn test_missing_variable_is_no_config() {
        let btf = build_btf("other_prog", &[("priority", 7)], VarLinkage::Global, None);
        assert_matches!(
            parse_run_config(&btf, "xdp_filter"),
            Err(XdpManError::NoRunConfig)
        );
    }

    #[test]
    fn test_unknown_member_is_malformed() {
        let btf = build_btf(
            "xdp_filter",
            &[("frequency", 9)],
            VarLinkage::Global,
            None,
        );
        assert_matches!(
            parse_run_config(&btf, "xdp_filter"),
            Err(XdpManError::MalformedRunConfig(_))
        );
    }

    #[test]
    fn test_lowercase_action_is_malformed() {
        let btf = build_btf("xdp_filter", &[("xdp_pass", 1)], VarLinkage::Global, None);
        assert_matches!(
            parse_run_config(&btf, "xdp_filter"),
            Err(XdpManError::MalformedRunConfig(_))
        );
    }

    #[test]
    fn test_extern_linkage_is_malformed() {
        let btf = build_btf("xdp_filter", &[("priority", 7)], VarLinkage::Extern, None);
        assert_matches!(
            parse_run_config(&btf, "xdp_filter"),
            Err(XdpManError::MalformedRunConfig(_))
        );
    }

    #[test]
    fn test_struct_overrunning_section_is_malformed() {
        let btf = build_btf(
            "xdp_filter",
            &[("priority", 7), ("XDP_PASS", 1)],
            VarLinkage::Global,
            Some(4),
        );
        assert_matches!(
            parse_run_config(&btf, "xdp_filter"),
            Err(XdpManError::MalformedRunConfig(_))
        );
    }
}
