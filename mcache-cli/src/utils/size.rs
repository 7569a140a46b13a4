use crate::error::AppError;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// Parse a byte budget such as `512MB`, `1.5g` or `4096`.
pub fn parse_size(input: &str) -> Result<u64, AppError> {
    let input = input.trim().to_lowercase();
    if input.is_empty() {
        return Err(AppError::ParseError("Invalid size: empty string".to_string()));
    }

    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);

    let multiplier = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KB,
        "m" | "mb" | "mib" => MB,
        "g" | "gb" | "gib" => GB,
        "t" | "tb" | "tib" => TB,
        other => return Err(AppError::ParseError(format!("Invalid size unit: {other}"))),
    };

    if multiplier == 1 {
        return number
            .parse::<u64>()
            .map_err(|_| AppError::ParseError(format!("Invalid size: {input}")));
    }

    let value = number
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid size: {input}")))?;
    Ok((value * multiplier as f64) as u64)
}

/// Convert bytes to a human-readable format
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("512MB").unwrap(), 512 * MB);
        assert_eq!(parse_size(" 1.5g ").unwrap(), GB + GB / 2);
        assert_eq!(parse_size("64 KiB").unwrap(), 64 * KB);
        assert!(parse_size("").is_err());
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("1.5").is_err());
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(3 * MB / 2), "1.50 MB");
    }
}
