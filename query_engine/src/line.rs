use memtrace::{AccessKind, MemRef};

use crate::error::LineError;

/// Parse one `pc_hex,timestamp,kind,ea_hex` line (without its newline)
pub fn parse_line(line: &str) -> Result<MemRef, LineError> {
    let mut fields = line.trim_end_matches('\r').split(',');
    let (Some(pc), Some(timestamp), Some(kind), Some(ea), None) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return Err(LineError::FieldCount(line.split(',').count()));
    };

    let pc = parse_hex("pc", pc)?;
    let timestamp = timestamp
        .parse::<u64>()
        .map_err(|_| LineError::InvalidTimestamp(timestamp.to_owned()))?;
    let kind = match kind.len() {
        1 => kind.chars().next().and_then(AccessKind::from_tag),
        _ => None,
    }
    .ok_or_else(|| LineError::UnknownKind(kind.to_owned()))?;
    let ea = parse_hex("ea", ea)?;

    Ok(MemRef::new(pc, ea, kind, timestamp))
}

fn parse_hex(field: &'static str, value: &str) -> Result<u64, LineError> {
    u64::from_str_radix(value, 16).map_err(|_| LineError::InvalidHex {
        field,
        value: value.to_owned(),
    })
}
