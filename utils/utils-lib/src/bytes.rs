/// One kibibyte.
pub const KIB: u64 = 1024;
/// One mebibyte.
pub const MIB: u64 = KIB * 1024;
/// One gibibyte.
pub const GIB: u64 = MIB * 1024;

/// Converts bytes to human-readable values, eg: 1536 -> "1.5KiB".
pub fn into_human(bytes: u64) -> String {
    const SUFFIX: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    if bytes < KIB {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= KIB as f64 && unit < SUFFIX.len() - 1 {
        size /= KIB as f64;
        unit += 1;
    }
    let value = format!("{size:.1}");
    format!("{}{}", value.trim_end_matches(".0"), SUFFIX[unit])
}
