/// Parses a human readable size ("10GiB", "512 MiB", "1073741824") into bytes.
/// Decimal (kB/MB/...) and binary (KiB/MiB/...) suffixes are both accepted.
pub fn parse_size(input: &str) -> Result<u64, std::num::ParseIntError> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| input.len());
    let (digits, suffix) = input.split_at(split);
    let value: u64 = digits.parse()?;

    let multiplier: u64 = match suffix.trim() {
        "" | "B" => 1,
        "kB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "TB" => 1000 * 1000 * 1000 * 1000,
        "KiB" => 1024,
        "MiB" => 1024 * 1024,
        "GiB" => 1024 * 1024 * 1024,
        "TiB" => 1024 * 1024 * 1024 * 1024,
        // Force a failure on an unknown suffix.
        _ => return "?".parse(),
    };

    Ok(value * multiplier)
}
