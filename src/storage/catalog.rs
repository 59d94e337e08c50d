use crate::core::ZoneId;
use regex::Regex;

pub const INSTANCE_TABLE_PREFIX: &str = "instance_";
pub const RECORD_TABLE_PREFIX: &str = "record_";

lazy_static::lazy_static! {
    static ref INSTANCE_TABLE_PATTERN: Regex =
        Regex::new(r"^instance_([A-Za-z0-9_]{1,64})$").unwrap();
}

/// Which per-zone partition a table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Instance,
    Record,
}

/// Table name for a zone partition.
///
/// Names are built from a validated `ZoneId` only, never from request text.
pub fn table_name(kind: TableKind, zone: &ZoneId) -> String {
    match kind {
        TableKind::Instance => format!("{}{}", INSTANCE_TABLE_PREFIX, zone),
        TableKind::Record => format!("{}{}", RECORD_TABLE_PREFIX, zone),
    }
}

pub fn instance_table(zone: &ZoneId) -> String {
    table_name(TableKind::Instance, zone)
}

pub fn record_table(zone: &ZoneId) -> String {
    table_name(TableKind::Record, zone)
}

/// Recover the zone from an `instance_<zone>` table name.
///
/// Returns `None` for names that do not follow the partition pattern.
pub fn zone_of_instance_table(table: &str) -> Option<ZoneId> {
    let captures = INSTANCE_TABLE_PATTERN.captures(table)?;
    ZoneId::parse(captures.get(1)?.as_str()).ok()
}
