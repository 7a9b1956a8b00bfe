use std::time::Duration;

const UNITS: [(&str, u64); 4] = [("ms", 1), ("s", 1_000), ("m", 60_000), ("h", 3_600_000)];

/// Parse `<digits><unit>` where unit is one of `ms`, `s`, `m`, `h`; a bare
/// number is seconds.
pub(crate) fn parse_duration_value(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        return Err(format!("Invalid duration '{}'.", value));
    }
    let amount: u64 = digits
        .parse()
        .map_err(|err| format!("Invalid duration '{}': {}", value, err))?;
    let unit = if unit.is_empty() { "s" } else { unit };
    let millis_per_unit = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, millis)| *millis)
        .ok_or_else(|| format!("Invalid duration unit '{}'.", unit))?;
    let millis = amount
        .checked_mul(millis_per_unit)
        .ok_or_else(|| format!("Duration '{}' is too large.", value))?;
    if millis == 0 {
        return Err("Duration must be > 0.".to_owned());
    }
    Ok(Duration::from_millis(millis))
}
