//! Event compiler: textual event expressions to watchpoint value/mask
//! pairs, against a static channel/group field dictionary (§4.3).

pub mod fields;
pub mod opcode;

use regex::Regex;

use crate::error::{CmnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Req,
    Rsp,
    Snp,
    Dat,
}

impl Channel {
    pub fn chn_sel(&self) -> u8 {
        match self {
            Channel::Req => 0,
            Channel::Rsp => 1,
            Channel::Snp => 2,
            Channel::Dat => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Req => "req",
            Channel::Rsp => "rsp",
            Channel::Snp => "snp",
            Channel::Dat => "dat",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "req" => Ok(Channel::Req),
            "rsp" => Ok(Channel::Rsp),
            "snp" => Ok(Channel::Snp),
            "dat" => Ok(Channel::Dat),
            _ => Err(CmnError::ParseError {
                token: s.to_string(),
                reason: "channel must be one of req, rsp, snp, dat".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// A watchpoint's hardware binding, filled in once the event has been
/// programmed into a DTM.
#[derive(Debug, Clone, Copy)]
pub struct PmuInfo {
    pub xp_node_id: u16,
    pub wp_index: u8,
    /// DTC counter index, or `-1` in trace mode (no counter allocated).
    pub dtc_counter_index: i8,
}

/// A single match group: the fields accumulated under one `group=` item,
/// in the order they were written. `group` is the real group number
/// (0 or 1) this was parsed under, kept alongside the fields so it
/// survives filtering out empty groups — it is what gets looked up in
/// the field dictionary and written as `wp_grp`, not the group's
/// position among the surviving non-empty groups.
#[derive(Debug, Clone, Default)]
pub struct MatchGroup {
    pub group: u8,
    pub fields: Vec<(String, String)>,
}

impl MatchGroup {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A compiled event: a watchpoint predicate bound to one XP/port/channel.
#[derive(Debug, Clone)]
pub struct Event {
    pub mesh_index: u32,
    pub xp_nid: u16,
    pub port: u8,
    pub channel: Channel,
    pub direction: Direction,
    pub match_groups: Vec<MatchGroup>,
    pub wp_val_masks: Vec<(u64, u64)>,
    pub name: String,
    pub pmu_info: Option<PmuInfo>,
}

impl Event {
    pub fn chn_sel(&self) -> u8 {
        self.channel.chn_sel()
    }
}

/// Splits a multi-event command-line argument into its `cmn<N>/…/` tuples,
/// enforcing `^(cmn\d+/[^/]*/)(,cmn\d+/[^/]*/)*$` the way the CLI layer
/// validates it before handing events to the compiler.
pub fn split_event_tuples(s: &str) -> Result<Vec<String>> {
    let grouping = Regex::new(r"^(cmn\d+/[^/]*/)(,cmn\d+/[^/]*/)*$").unwrap();
    if !grouping.is_match(s) {
        return Err(CmnError::ParseError {
            token: s.to_string(),
            reason: "expected cmn<N>/item,item,.../ tuples separated by commas".into(),
        });
    }
    let tuple_re = Regex::new(r"cmn\d+/[^/]+/").unwrap();
    Ok(tuple_re.find_iter(s).map(|m| m.as_str().to_string()).collect())
}

/// Parses and compiles one `cmn<N>/item,item,.../` tuple into an [`Event`].
pub fn compile_event(tuple: &str) -> Result<Event> {
    let body = tuple.strip_suffix('/').ok_or_else(|| CmnError::ParseError {
        token: tuple.to_string(),
        reason: "event must end with '/'".into(),
    })?;
    let (mesh_part, items_part) = body.split_once('/').ok_or_else(|| CmnError::ParseError {
        token: tuple.to_string(),
        reason: "expected cmn<N>/items".into(),
    })?;
    let mesh_digits = mesh_part.strip_prefix("cmn").ok_or_else(|| CmnError::ParseError {
        token: tuple.to_string(),
        reason: "expected 'cmn' prefix".into(),
    })?;
    let mesh_index: u32 = mesh_digits.parse().map_err(|_| CmnError::ParseError {
        token: mesh_part.to_string(),
        reason: "invalid mesh index".into(),
    })?;

    let mut xp_nid: Option<u16> = None;
    let mut port: Option<u8> = None;
    let mut channel: Option<Channel> = None;
    let mut direction: Option<Direction> = None;
    let mut groups: Vec<MatchGroup> = vec![MatchGroup::default()];
    let mut current_group: usize = 0;

    for item in items_part.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item {
            "up" => {
                direction = Some(Direction::Up);
                continue;
            }
            "down" => {
                direction = Some(Direction::Down);
                continue;
            }
            _ => {}
        }
        let (key, value) = item.split_once('=').ok_or_else(|| CmnError::ParseError {
            token: item.to_string(),
            reason: "expected key=value or 'up'/'down'".into(),
        })?;
        match key {
            "xp" => {
                xp_nid = Some(value.parse().map_err(|_| CmnError::ParseError {
                    token: item.to_string(),
                    reason: "xp must be numeric".into(),
                })?)
            }
            "port" => {
                let p: u8 = value.parse().map_err(|_| CmnError::ParseError {
                    token: item.to_string(),
                    reason: "port must be numeric".into(),
                })?;
                if p > 5 {
                    return Err(CmnError::ParseError {
                        token: item.to_string(),
                        reason: "port must be in 0..5".into(),
                    });
                }
                port = Some(p);
            }
            "channel" => channel = Some(Channel::parse(value)?),
            "group" => {
                let g: usize = value.parse().map_err(|_| CmnError::ParseError {
                    token: item.to_string(),
                    reason: "group must be numeric".into(),
                })?;
                if g >= 2 {
                    return Err(CmnError::ParseError {
                        token: item.to_string(),
                        reason: "group must be 0 or 1".into(),
                    });
                }
                while groups.len() <= g {
                    let idx = groups.len() as u8;
                    groups.push(MatchGroup { group: idx, ..MatchGroup::default() });
                }
                current_group = g;
            }
            field => {
                groups[current_group]
                    .fields
                    .push((field.to_string(), value.to_string()));
            }
        }
    }

    let xp_nid = xp_nid.ok_or_else(|| CmnError::ParseError {
        token: tuple.to_string(),
        reason: "missing mandatory key 'xp'".into(),
    })?;
    let port = port.ok_or_else(|| CmnError::ParseError {
        token: tuple.to_string(),
        reason: "missing mandatory key 'port'".into(),
    })?;
    let channel = channel.ok_or_else(|| CmnError::ParseError {
        token: tuple.to_string(),
        reason: "missing mandatory key 'channel'".into(),
    })?;
    let direction = direction.ok_or_else(|| CmnError::ParseError {
        token: tuple.to_string(),
        reason: "missing direction ('up' or 'down')".into(),
    })?;

    for group in &groups {
        for (field, _) in &group.fields {
            if field == "srcid" && direction != Direction::Down {
                return Err(CmnError::ParseError {
                    token: field.clone(),
                    reason: "srcid requires 'down'".into(),
                });
            }
            if field == "tgtid" && direction != Direction::Up {
                return Err(CmnError::ParseError {
                    token: field.clone(),
                    reason: "tgtid requires 'up'".into(),
                });
            }
        }
    }

    // Keep at most two non-empty groups; if none are non-empty, keep one
    // empty group so the event still compiles a trivial (0, all-ones)
    // watchpoint.
    let mut non_empty: Vec<MatchGroup> = groups.into_iter().filter(|g| !g.is_empty()).collect();
    if non_empty.len() > 2 {
        return Err(CmnError::ParseError {
            token: tuple.to_string(),
            reason: "at most two match groups are supported".into(),
        });
    }
    if non_empty.is_empty() {
        non_empty.push(MatchGroup::default());
    }

    let mut wp_val_masks = Vec::with_capacity(non_empty.len());
    for group in non_empty.iter() {
        let mut value = 0u64;
        let mut mask = 0u64;
        for (field, raw_value) in &group.fields {
            let resolved = if field == "opcode" {
                opcode::resolve(channel, raw_value)?
            } else {
                parse_numeric(raw_value).ok_or_else(|| CmnError::ParseError {
                    token: raw_value.clone(),
                    reason: format!("invalid value for field {field:?}"),
                })?
            };
            let (v, m) = fields::value_mask(channel, group.group, field, resolved)?;
            debug_assert_eq!(mask & m, 0, "overlapping match fields in group {}", group.group);
            value |= v;
            mask |= m;
        }
        wp_val_masks.push((value, !mask));
    }

    let name = build_name(mesh_index, xp_nid, port, direction, channel, &non_empty);

    Ok(Event {
        mesh_index,
        xp_nid,
        port,
        channel,
        direction,
        match_groups: non_empty,
        wp_val_masks,
        name,
        pmu_info: None,
    })
}

fn build_name(
    mesh: u32,
    xp_nid: u16,
    port: u8,
    direction: Direction,
    channel: Channel,
    groups: &[MatchGroup],
) -> String {
    let mut name = format!(
        "cmn{mesh}-xp{xp_nid}-port{port}-{}-{}",
        direction.as_str(),
        channel.as_str()
    );
    for group in groups {
        for (field, value) in &group.fields {
            if field == "opcode" {
                name.push('-');
                name.push_str(value);
            } else {
                name.push_str(&format!("-{field}{value}"));
            }
        }
    }
    name
}

fn parse_numeric(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = s.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = s.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()
    } else {
        s.parse::<u64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_1_empty_match_group() {
        let ev = compile_event("cmn0/xp=8,port=1,up,group=0,channel=req/").unwrap();
        assert_eq!(ev.chn_sel(), 0);
        assert_eq!(ev.direction, Direction::Up);
        assert_eq!(ev.wp_val_masks, vec![(0, u64::MAX)]);
        assert_eq!(ev.name, "cmn0-xp8-port1-up-req");
    }

    #[test]
    fn scenario_2_opcode_resolves_through_channel_table() {
        let ev = compile_event("cmn1/xp=0,port=0,down,channel=dat,opcode=compdata/").unwrap();
        assert_eq!(ev.channel, Channel::Dat);
        let (value, mask) = ev.wp_val_masks[0];
        let range = fields::bit_range(Channel::Dat, 0, "opcode").unwrap();
        let resolved = opcode::resolve(Channel::Dat, "compdata").unwrap();
        assert_eq!((value >> range.lo) & ((1 << (range.hi - range.lo + 1)) - 1), resolved);
        assert_ne!(mask >> range.lo & ((1 << (range.hi - range.lo + 1)) - 1), 0);
        assert!(ev.name.ends_with("-compdata"));
    }

    #[test]
    fn lone_group_1_resolves_against_group_1_field_table() {
        // an empty group 0 must not collapse the real group-1 fields down
        // to position 0, or `addr` resolves against the wrong dictionary.
        let ev = compile_event("cmn0/xp=8,port=0,up,channel=req,group=1,addr=0x1000/").unwrap();
        assert_eq!(ev.match_groups.len(), 1);
        assert_eq!(ev.match_groups[0].group, 1);
        let range = fields::bit_range(Channel::Req, 1, "addr").unwrap();
        let width = range.hi - range.lo + 1;
        let field_mask = (1u64 << width) - 1;
        let (value, mask) = ev.wp_val_masks[0];
        assert_eq!((value >> range.lo) & field_mask, 0x1000);
        assert_ne!((!mask) >> range.lo & field_mask, 0);
    }

    #[test]
    fn item_ordering_does_not_affect_compiled_event() {
        let a = compile_event("cmn2/xp=4,port=2,channel=req,up,group=0,opcode=readonce/").unwrap();
        let b = compile_event("cmn2/opcode=readonce,group=0,up,channel=req,port=2,xp=4/").unwrap();
        assert_eq!(a.wp_val_masks, b.wp_val_masks);
        assert_eq!(a.chn_sel(), b.chn_sel());
        assert_eq!(a.direction, b.direction);
        assert_eq!(a.port, b.port);
        assert_eq!(a.xp_nid, b.xp_nid);
    }

    #[test]
    fn srcid_requires_down_and_tgtid_requires_up() {
        assert!(compile_event("cmn0/xp=0,port=0,up,channel=req,srcid=1/").is_err());
        assert!(compile_event("cmn0/xp=0,port=0,down,channel=req,tgtid=1/").is_err());
        assert!(compile_event("cmn0/xp=0,port=0,down,channel=req,srcid=1/").is_ok());
        assert!(compile_event("cmn0/xp=0,port=0,up,channel=req,tgtid=1/").is_ok());
    }

    #[test]
    fn more_than_two_groups_rejected() {
        let err = compile_event(
            "cmn0/xp=0,port=0,up,channel=req,group=0,opcode=readonce,group=1,tgtid=1,group=0,lpid=2/",
        );
        // group 0 gets two non-contiguous writes (opcode, then lpid) which
        // still count as one non-empty group; this should succeed.
        assert!(err.is_ok());
    }

    #[test]
    fn split_event_tuples_enforces_grouping_regex() {
        let tuples = split_event_tuples("cmn0/xp=0,port=0,up,channel=req/,cmn1/xp=1,port=1,down,channel=dat/").unwrap();
        assert_eq!(tuples.len(), 2);
        assert!(split_event_tuples("not-an-event").is_err());
    }
}
