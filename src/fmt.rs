const GROUP_SEP: char = '\u{202F}';
const NBSP: char = '\u{00A0}';

fn group_thousands(int_part: &str) -> String {
    let mut grouped = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(GROUP_SEP);
        }
        grouped.push(c);
    }
    grouped.chars().rev().collect()
}

/// Format an amount the way the French UI shows it: `1 234,56 €`, `1 235 XOF`.
pub fn format_currency(val: f64, code: &str) -> String {
    let code = code.trim().to_uppercase();
    let negative = val < 0.0;
    let sign = if negative { "-" } else { "" };
    let abs = val.abs();

    match code.as_str() {
        "XOF" => {
            let rounded = format!("{:.0}", abs);
            if rounded == "0" {
                return format!("0{NBSP}XOF");
            }
            format!("{sign}{}{NBSP}XOF", group_thousands(&rounded))
        }
        "EUR" | "" => {
            let cents = format!("{:.2}", abs);
            let (int_part, dec_part) = cents.split_once('.').unwrap_or((&cents, "00"));
            if int_part == "0" && dec_part == "00" {
                return format!("0,00{NBSP}€");
            }
            format!("{sign}{},{dec_part}{NBSP}€", group_thousands(int_part))
        }
        other => format!("{val:.2} {other}"),
    }
}

pub fn format_bytes(n: u64) -> String {
    if n >= 1_048_576 {
        format!("{:.1} MB", n as f64 / 1_048_576.0)
    } else if n >= 1024 {
        format!("{:.1} KB", n as f64 / 1024.0)
    } else {
        format!("{n} B")
    }
}
