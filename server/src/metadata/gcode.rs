//! G-code header metadata.
//!
//! Slicers emit their settings as `; key = value` comment lines —
//! BambuStudio and OrcaSlicer in a header block, PrusaSlicer mostly in a
//! footer block — plus base64-encoded thumbnail sections. Only the head
//! and tail of the file are scanned; the toolpath body is skipped.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use base64::Engine;

use super::{
    colors, parse_bool_like, parse_percent, split_generator, split_list, sum_csv_floats,
    ParsedFile,
};
use crate::db::library::{NormalizedMetadata, Thumbnail};
use crate::error::Result;

/// How much of each end of the file is scanned for comments.
const SCAN_WINDOW: usize = 512 * 1024;

pub fn parse(path: &Path) -> Result<ParsedFile> {
    let text = read_head_and_tail(path)?;
    Ok(parse_text(&text))
}

fn read_head_and_tail(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len() as usize;

    if len <= SCAN_WINDOW * 2 {
        let mut all = Vec::with_capacity(len);
        file.read_to_end(&mut all)?;
        return Ok(String::from_utf8_lossy(&all).into_owned());
    }

    let mut head = vec![0u8; SCAN_WINDOW];
    file.read_exact(&mut head)?;
    let mut tail = vec![0u8; SCAN_WINDOW];
    file.seek(SeekFrom::End(-(SCAN_WINDOW as i64)))?;
    file.read_exact(&mut tail)?;

    let mut text = String::from_utf8_lossy(&head).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&tail));
    Ok(text)
}

pub fn parse_text(text: &str) -> ParsedFile {
    let mut fields: HashMap<String, String> = HashMap::new();

    for line in text.lines() {
        let Some(comment) = line.trim().strip_prefix(';') else {
            continue;
        };
        let comment = comment.trim();

        // "key = value" and "key: value" forms, first value wins so the
        // header beats the footer on duplicates.
        let (key, value) = if let Some((k, v)) = comment.split_once('=') {
            (k, v)
        } else if let Some((k, v)) = comment.split_once(':') {
            (k, v)
        } else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase().replace(' ', "_");
        let value = value.trim().to_string();
        if !value.is_empty() {
            fields.entry(key).or_insert(value);
        }
    }

    let meta = normalize(&fields, text);
    let thumbnail = extract_thumbnail(text);
    ParsedFile { meta, thumbnail }
}

fn first<'a>(fields: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| fields.get(*k))
        .map(String::as_str)
}

fn normalize(fields: &HashMap<String, String>, text: &str) -> NormalizedMetadata {
    let mut meta = NormalizedMetadata::default();

    meta.layer_height_mm = first(fields, &["layer_height"]).and_then(|v| v.parse().ok());
    meta.first_layer_height_mm = first(
        fields,
        &["first_layer_height", "initial_layer_print_height", "initial_layer_height"],
    )
    .and_then(|v| v.parse().ok());
    meta.nozzle_diameter_mm = first(fields, &["nozzle_diameter"])
        .and_then(|v| sum_csv_floats(v).map(|s| s / v.split(',').filter(|p| !p.trim().is_empty()).count().max(1) as f64));
    meta.wall_count = first(fields, &["wall_loops", "perimeters"]).and_then(|v| v.parse().ok());
    meta.infill_density_pct = first(
        fields,
        &["sparse_infill_density", "fill_density", "infill_density"],
    )
    .and_then(parse_percent);
    meta.infill_pattern = first(
        fields,
        &["sparse_infill_pattern", "fill_pattern", "infill_pattern"],
    )
    .map(str::to_string);
    meta.support_used = first(
        fields,
        &["enable_support", "support_used", "support_material"],
    )
    .map(parse_bool_like);

    meta.nozzle_temp_c = first(
        fields,
        &[
            "nozzle_temperature_initial_layer",
            "nozzle_temperature",
            "first_layer_temperature",
            "temperature",
        ],
    )
    .and_then(|v| sum_csv_floats(v).map(|s| {
        let n = v.split(',').filter(|p| !p.trim().is_empty()).count().max(1);
        (s / n as f64) as i64
    }));
    meta.bed_temp_c = first(
        fields,
        &[
            "bed_temperature_initial_layer_single",
            "bed_temperature_initial_layer",
            "bed_temperature",
            "first_layer_bed_temperature",
        ],
    )
    .and_then(|v| sum_csv_floats(v).map(|s| {
        let n = v.split(',').filter(|p| !p.trim().is_empty()).count().max(1);
        (s / n as f64) as i64
    }));
    meta.print_speed_mm_s = first(
        fields,
        &["outer_wall_speed", "print_speed", "perimeter_speed"],
    )
    .and_then(|v| v.parse().ok());
    meta.total_layer_count = first(
        fields,
        &["total_layer_number", "total_layer_count", "layer_count"],
    )
    .and_then(|v| v.parse().ok());

    // Per-extruder material figures arrive comma-separated and sum.
    meta.total_weight_g = first(
        fields,
        &["total_filament_used_[g]", "filament_used_[g]", "total_filament_weight_[g]"],
    )
    .and_then(sum_csv_floats);
    meta.filament_length_m = first(fields, &["filament_used_[mm]", "filament_used_[m]"])
        .and_then(sum_csv_floats)
        .map(|total| {
            // Lengths are stored in meters.
            if first(fields, &["filament_used_[m]"]).is_some() {
                total
            } else {
                total / 1000.0
            }
        });

    if let Some(types) = first(fields, &["filament_type"]) {
        meta.material_types = split_list(types);
    }
    if let Some(raw_colors) = first(fields, &["filament_colour", "filament_color", "filament_colors"]) {
        let hex_list = split_list(raw_colors);
        meta.filament_colors = colors::names_for(&hex_list);
        meta.primary_color = meta.filament_colors.first().cloned();
        meta.color_display = colors::display_string(&meta.filament_colors);
    }

    if let Some(printers) = first(fields, &["compatible_printers", "printer_model"]) {
        meta.compatible_printers = split_list(printers);
    }
    meta.bed_type = first(fields, &["curr_bed_type"]).map(str::to_string);

    // Generator line: "; generated by PrusaSlicer 2.7.1" or a bare
    // "; BambuStudio 01.08.00.57" first line.
    let generator = text
        .lines()
        .take(20)
        .filter_map(|l| l.trim().strip_prefix(';'))
        .map(str::trim)
        .find_map(|c| {
            c.strip_prefix("generated by ")
                .map(|rest| rest.split(" on ").next().unwrap_or(rest).to_string())
                .or_else(|| {
                    let known = ["BambuStudio", "OrcaSlicer", "PrusaSlicer", "SuperSlicer"];
                    known
                        .iter()
                        .any(|k| c.starts_with(k))
                        .then(|| c.to_string())
                })
        });
    if let Some(generator) = generator {
        let (name, version) = split_generator(&generator);
        meta.slicer_name = name;
        meta.slicer_version = version;
    }

    meta
}

/// Decode the largest embedded thumbnail block:
/// `; thumbnail begin 300x300 12345` … base64 lines … `; thumbnail end`.
fn extract_thumbnail(text: &str) -> Option<Thumbnail> {
    let mut best: Option<Thumbnail> = None;
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let comment = line.trim().strip_prefix(';').map(str::trim).unwrap_or("");
        let Some(rest) = comment.strip_prefix("thumbnail begin") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let dims = parts.next().unwrap_or("");
        let (w, h) = match dims.split_once('x') {
            Some((w, h)) => (w.parse::<u32>().ok(), h.parse::<u32>().ok()),
            None => (None, None),
        };
        let (Some(width), Some(height)) = (w, h) else {
            continue;
        };

        let mut encoded = String::new();
        for body_line in lines.by_ref() {
            let body = body_line.trim().strip_prefix(';').map(str::trim).unwrap_or("");
            if body.starts_with("thumbnail end") {
                break;
            }
            encoded.push_str(body);
        }

        let Ok(png) = base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes()) else {
            tracing::debug!("undecodable thumbnail block, skipping");
            continue;
        };

        let replace = best
            .as_ref()
            .map(|b| (width * height) > (b.width * b.height))
            .unwrap_or(true);
        if replace {
            best = Some(Thumbnail { png, width, height });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const BAMBU_HEADER: &str = "\
; BambuStudio 01.08.00.57
; total layer number: 253
; layer_height = 0.2
; first_layer_height = 0.25
; nozzle_diameter = 0.4
; wall_loops = 3
; sparse_infill_density = 15%
; sparse_infill_pattern = gyroid
; enable_support = 1
; nozzle_temperature = 220,220
; bed_temperature = 65
; outer_wall_speed = 120
; filament_type = PLA;PETG
; filament_colour = #000000;#FFFFFF
; total filament used [g] : 15.5,8.3,
; filament used [mm] = 5230.5,2100.0
";

    #[test]
    fn bambu_header_fields_normalize() {
        let parsed = parse_text(BAMBU_HEADER);
        let meta = &parsed.meta;

        assert_eq!(meta.layer_height_mm, Some(0.2));
        assert_eq!(meta.first_layer_height_mm, Some(0.25));
        assert_eq!(meta.wall_count, Some(3));
        assert_eq!(meta.infill_density_pct, Some(15.0));
        assert_eq!(meta.infill_pattern.as_deref(), Some("gyroid"));
        assert_eq!(meta.support_used, Some(true));
        assert_eq!(meta.nozzle_temp_c, Some(220));
        assert_eq!(meta.bed_temp_c, Some(65));
        assert_eq!(meta.print_speed_mm_s, Some(120.0));
        assert_eq!(meta.total_layer_count, Some(253));
        assert_eq!(meta.material_types, vec!["PLA", "PETG"]);
        assert_eq!(meta.primary_color.as_deref(), Some("Black"));
        assert_eq!(meta.color_display.as_deref(), Some("Black & White"));
        assert_eq!(meta.slicer_name.as_deref(), Some("BambuStudio"));
        assert_eq!(meta.slicer_version.as_deref(), Some("01.08.00.57"));
    }

    #[test]
    fn multi_extruder_weight_sums_with_trailing_empty() {
        let parsed = parse_text(BAMBU_HEADER);
        assert_eq!(parsed.meta.total_weight_g, Some(23.8));
    }

    #[test]
    fn filament_length_converts_mm_to_m() {
        let parsed = parse_text(BAMBU_HEADER);
        let length = parsed.meta.filament_length_m.unwrap();
        assert!((length - 7.3305).abs() < 1e-6);
    }

    #[test]
    fn prusa_footer_style_parses() {
        let text = "\
; generated by PrusaSlicer 2.7.1+linux
G1 X0 Y0
; layer_height = 0.15
; perimeters = 2
; fill_density = 20%
; filament_type = PLA
; temperature = 215
; first_layer_bed_temperature = 60
";
        let meta = parse_text(text).meta;
        assert_eq!(meta.layer_height_mm, Some(0.15));
        assert_eq!(meta.wall_count, Some(2));
        assert_eq!(meta.infill_density_pct, Some(20.0));
        assert_eq!(meta.nozzle_temp_c, Some(215));
        assert_eq!(meta.slicer_name.as_deref(), Some("PrusaSlicer"));
        assert_eq!(meta.slicer_version.as_deref(), Some("2.7.1+linux"));
    }

    #[test]
    fn idempotent_over_same_input() {
        let once = parse_text(BAMBU_HEADER).meta;
        let twice = parse_text(BAMBU_HEADER).meta;
        assert_eq!(once, twice);
    }

    #[test]
    fn largest_thumbnail_wins() {
        let small = base64::engine::general_purpose::STANDARD.encode(b"small-png");
        let large = base64::engine::general_purpose::STANDARD.encode(b"large-png");
        let text = format!(
            "; thumbnail begin 16x16 9\n; {small}\n; thumbnail end\n\
             ; thumbnail begin 300x300 9\n; {large}\n; thumbnail end\n"
        );
        let thumb = extract_thumbnail(&text).unwrap();
        assert_eq!(thumb.width, 300);
        assert_eq!(thumb.png, b"large-png");
    }

    #[test]
    fn no_comments_yields_empty_metadata() {
        let meta = parse_text("G1 X10 Y10\nG1 X20 Y20\n").meta;
        assert_eq!(meta, NormalizedMetadata::default());
    }
}
