//! 3MF package analysis.
//!
//! A 3MF is a Zip container. Bambu-flavored packages carry
//! `Metadata/plate_1.json` (object layout), `Metadata/
//! process_settings_1.config` (print settings as JSON, values often
//! wrapped in one-element arrays), `Metadata/slice_info.config`
//! (XML material/weight summary), and PNG plate thumbnails.

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;
use zip::ZipArchive;

use super::{
    colors, parse_bool_like, parse_percent, split_generator, split_list, ParsedFile,
};
use crate::db::library::{NormalizedMetadata, Thumbnail};
use crate::error::{Result, ServiceError};

pub fn parse(path: &Path) -> Result<ParsedFile> {
    let file = std::fs::File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| ServiceError::Integrity(format!("not a valid 3MF container: {e}")))?;

    let plate = read_json(&mut archive, "Metadata/plate_1.json");
    let process = read_json(&mut archive, "Metadata/process_settings_1.config");
    let slice_info = read_string(&mut archive, "Metadata/slice_info.config")
        .map(|xml| parse_slice_info(&xml));

    let mut meta = NormalizedMetadata::default();
    if let Some(plate) = &plate {
        apply_plate(&mut meta, plate);
    }
    if let Some(process) = &process {
        apply_process_settings(&mut meta, process);
    }
    if let Some(slice_info) = &slice_info {
        apply_slice_info(&mut meta, slice_info);
    }

    // Colors can come from slice_info filaments or the plate JSON;
    // whichever produced them, derive the display fields once.
    if !meta.filament_colors.is_empty() {
        meta.primary_color = meta.filament_colors.first().cloned();
        meta.color_display = colors::display_string(&meta.filament_colors);
    }

    let thumbnail = largest_thumbnail(&mut archive);
    Ok(ParsedFile { meta, thumbnail })
}

fn read_string<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut content = String::new();
    entry.read_to_string(&mut content).ok()?;
    Some(content)
}

fn read_json<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Option<Value> {
    serde_json::from_str(&read_string(archive, name)?).ok()
}

/// A `Value` that may be a scalar or a one-element array of scalars
/// (the Bambu process-settings format wraps most values in arrays).
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => items.first().and_then(scalar),
        _ => None,
    }
}

fn setting(process: &Value, key: &str) -> Option<String> {
    process.get(key).and_then(scalar)
}

fn apply_plate(meta: &mut NormalizedMetadata, plate: &Value) {
    if let Some(bbox) = plate.get("bbox_all").and_then(Value::as_array) {
        let coords: Vec<f64> = bbox.iter().filter_map(Value::as_f64).collect();
        if coords.len() == 4 {
            meta.width_mm = Some(round2(coords[2] - coords[0]));
            meta.depth_mm = Some(round2(coords[3] - coords[1]));
        }
    }

    if let Some(objects) = plate.get("bbox_objects").and_then(Value::as_array) {
        // The wipe tower is plumbing, not a printed object.
        let count = objects
            .iter()
            .filter(|o| o.get("name").and_then(Value::as_str) != Some("wipe_tower"))
            .count();
        meta.object_count = Some(count as i64);
    }

    if meta.filament_colors.is_empty() {
        if let Some(raw) = plate.get("filament_colors").and_then(Value::as_array) {
            let hex: Vec<String> = raw
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if !hex.is_empty() {
                meta.filament_colors = colors::names_for(&hex);
            }
        }
    }
}

fn apply_process_settings(meta: &mut NormalizedMetadata, process: &Value) {
    meta.layer_height_mm = setting(process, "layer_height")
        .and_then(|v| v.parse().ok())
        .or(meta.layer_height_mm);
    meta.first_layer_height_mm = setting(process, "initial_layer_print_height")
        .or_else(|| setting(process, "first_layer_height"))
        .and_then(|v| v.parse().ok())
        .or(meta.first_layer_height_mm);
    meta.nozzle_diameter_mm = setting(process, "nozzle_diameter")
        .and_then(|v| v.parse().ok())
        .or(meta.nozzle_diameter_mm);
    meta.wall_count = setting(process, "wall_loops")
        .and_then(|v| v.parse().ok())
        .or(meta.wall_count);
    meta.infill_density_pct = setting(process, "sparse_infill_density")
        .as_deref()
        .and_then(parse_percent)
        .or(meta.infill_density_pct);
    meta.infill_pattern = setting(process, "sparse_infill_pattern").or(meta.infill_pattern.take());
    if let Some(support) = setting(process, "enable_support") {
        meta.support_used = Some(parse_bool_like(&support));
    }
    meta.nozzle_temp_c = setting(process, "nozzle_temperature_initial_layer")
        .or_else(|| setting(process, "nozzle_temperature"))
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as i64)
        .or(meta.nozzle_temp_c);
    meta.bed_temp_c = setting(process, "bed_temperature_initial_layer_single")
        .or_else(|| setting(process, "bed_temperature"))
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as i64)
        .or(meta.bed_temp_c);
    meta.print_speed_mm_s = setting(process, "outer_wall_speed")
        .or_else(|| setting(process, "print_speed"))
        .and_then(|v| v.parse().ok())
        .or(meta.print_speed_mm_s);

    if let Some(printers) = process.get("compatible_printers") {
        meta.compatible_printers = match printers {
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Value::String(joined) => split_list(joined),
            _ => Vec::new(),
        };
    }
    meta.bed_type = setting(process, "curr_bed_type").or(meta.bed_type.take());

    if let Some(generator) = setting(process, "generator") {
        let (name, version) = split_generator(&generator);
        meta.slicer_name = name;
        meta.slicer_version = version;
    }
}

/// Parsed form of `Metadata/slice_info.config`.
#[derive(Debug, Default, PartialEq)]
pub struct SliceInfo {
    pub weight_g: Option<f64>,
    pub prediction_s: Option<i64>,
    pub support_used: Option<bool>,
    pub filaments: Vec<SliceFilament>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct SliceFilament {
    pub material: Option<String>,
    pub color: Option<String>,
    pub used_m: Option<f64>,
    pub used_g: Option<f64>,
}

pub fn parse_slice_info(xml: &str) -> SliceInfo {
    let mut info = SliceInfo::default();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "malformed slice_info.config");
                break;
            }
        };
        match event {
            Event::Empty(ref element) | Event::Start(ref element) => {
                let name = element.name();
                let name = String::from_utf8_lossy(name.as_ref()).to_string();
                let attr = |wanted: &str| -> Option<String> {
                    element.attributes().flatten().find_map(|a| {
                        (String::from_utf8_lossy(a.key.as_ref()) == wanted)
                            .then(|| String::from_utf8_lossy(&a.value).to_string())
                    })
                };

                match name.as_str() {
                    "metadata" => {
                        let key = attr("key").unwrap_or_default();
                        let value = attr("value").unwrap_or_default();
                        match key.as_str() {
                            "weight" => info.weight_g = value.parse().ok(),
                            "prediction" => info.prediction_s = value.parse().ok(),
                            "support_used" => info.support_used = Some(parse_bool_like(&value)),
                            _ => {}
                        }
                    }
                    "filament" => {
                        info.filaments.push(SliceFilament {
                            material: attr("type"),
                            color: attr("color"),
                            used_m: attr("used_m").and_then(|v| v.parse().ok()),
                            used_g: attr("used_g").and_then(|v| v.parse().ok()),
                        });
                    }
                    "header_item" => {
                        let key = attr("key").unwrap_or_default();
                        let value = attr("value").unwrap_or_default();
                        match key.as_str() {
                            "X-BBL-Client-Type" if value == "slicer" => {
                                info.client_name = Some("BambuStudio".to_string());
                            }
                            "X-BBL-Client-Version" => info.client_version = Some(value),
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    info
}

fn apply_slice_info(meta: &mut NormalizedMetadata, info: &SliceInfo) {
    // Per-filament usage sums across extruders; the plate-level weight
    // is the fallback.
    let used_g: Vec<f64> = info.filaments.iter().filter_map(|f| f.used_g).collect();
    meta.total_weight_g = if used_g.is_empty() {
        info.weight_g
    } else {
        Some(round2(used_g.iter().sum()))
    }
    .or(meta.total_weight_g);

    let used_m: Vec<f64> = info.filaments.iter().filter_map(|f| f.used_m).collect();
    if !used_m.is_empty() {
        meta.filament_length_m = Some(round2(used_m.iter().sum()));
    }

    let materials: Vec<String> = info
        .filaments
        .iter()
        .filter_map(|f| f.material.clone())
        .collect();
    if !materials.is_empty() {
        meta.material_types = materials;
    }

    let hex: Vec<String> = info.filaments.iter().filter_map(|f| f.color.clone()).collect();
    if !hex.is_empty() {
        meta.filament_colors = colors::names_for(&hex);
    }

    if meta.support_used.is_none() {
        meta.support_used = info.support_used;
    }
    if meta.slicer_name.is_none() {
        meta.slicer_name = info.client_name.clone();
        meta.slicer_version = info.client_version.clone();
    }
}

fn largest_thumbnail<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>) -> Option<Thumbnail> {
    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().to_string()))
        .filter(|n| n.starts_with("Metadata/") && n.to_ascii_lowercase().ends_with(".png"))
        .collect();

    let mut best: Option<Thumbnail> = None;
    for name in names {
        let Ok(mut entry) = archive.by_name(&name) else {
            continue;
        };
        let mut png = Vec::new();
        if entry.read_to_end(&mut png).is_err() {
            continue;
        }
        let Ok(decoded) = image::load_from_memory(&png) else {
            continue;
        };
        let (width, height) = (decoded.width(), decoded.height());
        let replace = best
            .as_ref()
            .map(|b| width * height > b.width * b.height)
            .unwrap_or(true);
        if replace {
            best = Some(Thumbnail { png, width, height });
        }
    }
    best
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    const SLICE_INFO: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<config>
  <header>
    <header_item key="X-BBL-Client-Type" value="slicer"/>
    <header_item key="X-BBL-Client-Version" value="01.08.00.57"/>
  </header>
  <plate>
    <metadata key="index" value="1"/>
    <metadata key="weight" value="25.0"/>
    <metadata key="prediction" value="5460"/>
    <metadata key="support_used" value="false"/>
    <filament id="1" type="PLA" color="#000000" used_m="5.2" used_g="15.5"/>
    <filament id="2" type="PETG" color="#FFFFFF" used_m="2.8" used_g="8.3"/>
  </plate>
</config>"##;

    fn build_3mf(with_plate: bool) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = SimpleFileOptions::default();

            if with_plate {
                writer.start_file("Metadata/plate_1.json", options).unwrap();
                writer
                    .write_all(
                        serde_json::json!({
                            "bbox_all": [90.0, 90.0, 166.2, 140.8],
                            "bbox_objects": [
                                { "name": "Benchy", "area": 1800.0 },
                                { "name": "wipe_tower", "area": 400.0 }
                            ],
                            "filament_colors": ["#000000", "#FFFFFF"]
                        })
                        .to_string()
                        .as_bytes(),
                    )
                    .unwrap();
            }

            writer
                .start_file("Metadata/process_settings_1.config", options)
                .unwrap();
            writer
                .write_all(
                    serde_json::json!({
                        "layer_height": ["0.2"],
                        "initial_layer_print_height": ["0.25"],
                        "wall_loops": ["3"],
                        "nozzle_diameter": ["0.4"],
                        "sparse_infill_density": ["15%"],
                        "sparse_infill_pattern": ["gyroid"],
                        "enable_support": ["1"],
                        "nozzle_temperature": ["220"],
                        "bed_temperature": ["65"],
                        "outer_wall_speed": ["120"],
                        "compatible_printers": ["Bambu Lab X1 Carbon 0.4 nozzle"],
                        "curr_bed_type": "Textured PEI Plate"
                    })
                    .to_string()
                    .as_bytes(),
                )
                .unwrap();

            writer
                .start_file("Metadata/slice_info.config", options)
                .unwrap();
            writer.write_all(SLICE_INFO.as_bytes()).unwrap();

            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn parse_bytes(bytes: Vec<u8>) -> ParsedFile {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.3mf");
        std::fs::write(&path, bytes).unwrap();
        parse(&path).unwrap()
    }

    #[test]
    fn slice_info_xml_parses_filaments_and_weight() {
        let info = parse_slice_info(SLICE_INFO);
        assert_eq!(info.weight_g, Some(25.0));
        assert_eq!(info.prediction_s, Some(5460));
        assert_eq!(info.support_used, Some(false));
        assert_eq!(info.filaments.len(), 2);
        assert_eq!(info.filaments[0].material.as_deref(), Some("PLA"));
        assert_eq!(info.client_name.as_deref(), Some("BambuStudio"));
        assert_eq!(info.client_version.as_deref(), Some("01.08.00.57"));
    }

    #[test]
    fn full_package_normalizes_all_sections() {
        let parsed = parse_bytes(build_3mf(true));
        let meta = &parsed.meta;

        // Plate geometry, wipe tower excluded from the count.
        assert_eq!(meta.width_mm, Some(76.2));
        assert_eq!(meta.depth_mm, Some(50.8));
        assert_eq!(meta.object_count, Some(1));

        // Process settings.
        assert_eq!(meta.layer_height_mm, Some(0.2));
        assert_eq!(meta.first_layer_height_mm, Some(0.25));
        assert_eq!(meta.wall_count, Some(3));
        assert_eq!(meta.infill_density_pct, Some(15.0));
        assert_eq!(meta.support_used, Some(true));
        assert_eq!(meta.bed_type.as_deref(), Some("Textured PEI Plate"));
        assert_eq!(
            meta.compatible_printers,
            vec!["Bambu Lab X1 Carbon 0.4 nozzle"]
        );

        // Material info: per-extruder sums.
        assert_eq!(meta.total_weight_g, Some(23.8));
        assert_eq!(meta.filament_length_m, Some(8.0));
        assert_eq!(meta.material_types, vec!["PLA", "PETG"]);
        assert_eq!(meta.primary_color.as_deref(), Some("Black"));
        assert_eq!(meta.color_display.as_deref(), Some("Black & White"));

        assert_eq!(meta.slicer_name.as_deref(), Some("BambuStudio"));
    }

    #[test]
    fn missing_plate_json_still_yields_settings() {
        let parsed = parse_bytes(build_3mf(false));
        assert_eq!(parsed.meta.width_mm, None);
        assert_eq!(parsed.meta.layer_height_mm, Some(0.2));
        assert_eq!(parsed.meta.total_weight_g, Some(23.8));
    }

    #[test]
    fn non_zip_file_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.3mf");
        std::fs::write(&path, b"definitely not a zip").unwrap();
        assert!(matches!(
            parse(&path),
            Err(ServiceError::Integrity(_))
        ));
    }

    #[test]
    fn extraction_is_deterministic() {
        let bytes = build_3mf(true);
        let once = parse_bytes(bytes.clone()).meta;
        let twice = parse_bytes(bytes).meta;
        assert_eq!(once, twice);
    }
}
