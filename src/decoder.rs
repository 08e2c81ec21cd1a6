//! Decodes captured 192-bit flits into named fields, one static map per
//! channel (§4.7).

use crate::event::{opcode, Channel};
use crate::packet::Packet;

struct Field {
    name: &'static str,
    lo: u32,
    hi: u32,
}

macro_rules! fields {
    ($(($name:expr, $lo:expr, $hi:expr)),+ $(,)?) => {
        &[$(Field { name: $name, lo: $lo, hi: $hi }),+]
    };
}

fn fields_for(channel: Channel) -> &'static [Field] {
    use Channel::*;
    match channel {
        Req => fields! {
            ("srcid", 15, 25),
            ("tgtid", 4, 14),
            ("txnid", 26, 37),
            ("opcode", 62, 68),
            ("lpid", 86, 90),
            ("mpam", 99, 109),
            ("addr", 110, 161),
            ("cycle", 176, 191),
        },
        Rsp => fields! {
            ("srcid", 15, 25),
            ("tgtid", 4, 14),
            ("txnid", 26, 37),
            ("opcode", 38, 42),
            ("dbid", 54, 65),
            ("cbusy", 51, 53),
            ("cycle", 176, 191),
        },
        Snp => fields! {
            ("srcid", 4, 14),
            ("fwdnid", 27, 37),
            ("txnid", 15, 26),
            ("opcode", 50, 54),
            ("mpam", 59, 69),
            ("addr", 70, 118),
            ("cycle", 176, 191),
        },
        Dat => fields! {
            ("srcid", 15, 25),
            ("tgtid", 4, 14),
            ("txnid", 26, 37),
            ("opcode", 49, 52),
            ("homenid", 38, 48),
            ("dbid", 65, 76),
            ("resp", 55, 57),
            ("datasrc", 58, 61),
            ("cbusy", 62, 64),
            ("cycle", 176, 191),
        },
    }
}

/// Lists the field names this channel decodes, in declaration order.
pub fn field_names(channel: Channel) -> impl Iterator<Item = &'static str> {
    fields_for(channel).iter().map(|f| f.name)
}

/// Decodes every named field from `packet` for `channel`. The `opcode`
/// field decodes through the reverse of the event compiler's opcode table.
pub fn decode(channel: Channel, packet: &Packet) -> Vec<(&'static str, String)> {
    fields_for(channel)
        .iter()
        .map(|f| {
            let raw = packet.get(f.lo, f.hi) as u64;
            let text = if f.name == "opcode" {
                opcode::name(channel, raw)
            } else {
                raw.to_string()
            };
            (f.name, text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_opcode_decodes_through_reverse_table() {
        let mut value: u128 = 0;
        value |= (0x07u128) << 62; // ReadUnique
        let w0 = value as u64;
        let w1 = (value >> 64) as u64;
        let packet = Packet::from_words(w0, w1, 0);
        let decoded = decode(Channel::Req, &packet);
        let opcode_field = decoded.iter().find(|(n, _)| *n == "opcode").unwrap();
        assert_eq!(opcode_field.1, "readunique");
    }
}
