//! Filament color naming.
//!
//! Slicers record filament colors as `#RRGGBB` values; the library wants
//! human-readable names. Colors map to the nearest entry of a small
//! named palette, and multi-filament jobs get a joined display string.

/// Named palette used for nearest-color naming.
const PALETTE: &[(&str, (u8, u8, u8))] = &[
    ("Black", (0x00, 0x00, 0x00)),
    ("White", (0xFF, 0xFF, 0xFF)),
    ("Gray", (0x80, 0x80, 0x80)),
    ("Silver", (0xC0, 0xC0, 0xC0)),
    ("Red", (0xE0, 0x20, 0x20)),
    ("Dark Red", (0x8B, 0x00, 0x00)),
    ("Orange", (0xFF, 0x80, 0x00)),
    ("Yellow", (0xFF, 0xE0, 0x00)),
    ("Green", (0x20, 0xA0, 0x20)),
    ("Dark Green", (0x00, 0x64, 0x00)),
    ("Teal", (0x00, 0x80, 0x80)),
    ("Cyan", (0x00, 0xD0, 0xE0)),
    ("Blue", (0x20, 0x50, 0xE0)),
    ("Navy", (0x00, 0x00, 0x80)),
    ("Purple", (0x80, 0x20, 0xC0)),
    ("Pink", (0xFF, 0x80, 0xC0)),
    ("Magenta", (0xE0, 0x20, 0xA0)),
    ("Brown", (0x80, 0x50, 0x20)),
    ("Beige", (0xE8, 0xD8, 0xB0)),
    ("Gold", (0xD4, 0xAF, 0x37)),
];

fn parse_hex(raw: &str) -> Option<(u8, u8, u8)> {
    let hex = raw.trim().trim_start_matches('#');
    if hex.len() < 6 {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((r, g, b))
}

/// Name for one `#RRGGBB` color: nearest palette entry by RGB distance.
pub fn name_for(raw: &str) -> Option<String> {
    let (r, g, b) = parse_hex(raw)?;
    PALETTE
        .iter()
        .min_by_key(|(_, (pr, pg, pb))| {
            let dr = r as i32 - *pr as i32;
            let dg = g as i32 - *pg as i32;
            let db = b as i32 - *pb as i32;
            dr * dr + dg * dg + db * db
        })
        .map(|(name, _)| name.to_string())
}

/// Names for a list of hex colors; entries that fail to parse are kept
/// as their raw value so nothing silently disappears.
pub fn names_for(raw_colors: &[String]) -> Vec<String> {
    raw_colors
        .iter()
        .map(|c| name_for(c).unwrap_or_else(|| c.clone()))
        .collect()
}

/// Human-readable display string: one name alone, two joined with
/// " & ", three as "A, B & C". Longer lists keep the first three.
pub fn display_string(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [only] => Some(only.clone()),
        [first, second] => Some(format!("{first} & {second}")),
        [first, second, third, ..] => Some(format!("{first}, {second} & {third}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_palette_colors_name_themselves() {
        assert_eq!(name_for("#000000").as_deref(), Some("Black"));
        assert_eq!(name_for("#FFFFFF").as_deref(), Some("White"));
    }

    #[test]
    fn nearby_colors_snap_to_the_closest_name() {
        assert_eq!(name_for("#F81010").as_deref(), Some("Red"));
        assert_eq!(name_for("#102020").as_deref(), Some("Black"));
    }

    #[test]
    fn unparseable_values_pass_through() {
        let names = names_for(&["#000000".into(), "not-a-color".into()]);
        assert_eq!(names, vec!["Black".to_string(), "not-a-color".to_string()]);
    }

    #[test]
    fn display_joins_two_and_three_colors() {
        assert_eq!(display_string(&["Black".into()]).as_deref(), Some("Black"));
        assert_eq!(
            display_string(&["Black".into(), "White".into()]).as_deref(),
            Some("Black & White")
        );
        assert_eq!(
            display_string(&["Black".into(), "White".into(), "Red".into()]).as_deref(),
            Some("Black, White & Red")
        );
        assert_eq!(display_string(&[]), None);
    }
}
