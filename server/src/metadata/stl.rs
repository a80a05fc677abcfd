//! STL mesh analysis.
//!
//! Both binary and ASCII STL are handled. The parser derives bounding
//! box, volume, surface area, vertex/face counts, and watertightness
//! (every edge shared by exactly two triangles), which feed the
//! complexity score.

use std::collections::HashMap;
use std::path::Path;

use super::{complexity_score, difficulty_for, ParsedFile};
use crate::db::library::NormalizedMetadata;
use crate::error::{Result, ServiceError};

#[derive(Debug, Clone, Copy)]
struct Triangle {
    vertices: [[f64; 3]; 3],
}

#[derive(Debug)]
pub struct MeshMetrics {
    pub vertex_count: usize,
    pub face_count: usize,
    pub width_mm: f64,
    pub depth_mm: f64,
    pub height_mm: f64,
    pub volume_mm3: f64,
    pub surface_area_mm2: f64,
    pub watertight: bool,
    pub has_holes: bool,
}

pub fn parse(path: &Path) -> Result<ParsedFile> {
    let bytes = std::fs::read(path)?;
    let metrics = analyze(&bytes)?;

    let volume_cm3 = metrics.volume_mm3 / 1000.0;
    let surface_area_cm2 = metrics.surface_area_mm2 / 100.0;
    let ratio = (volume_cm3 > 0.0).then(|| surface_area_cm2 / volume_cm3);
    let score = complexity_score(
        metrics.vertex_count,
        ratio,
        metrics.watertight,
        metrics.has_holes,
    );

    let meta = NormalizedMetadata {
        width_mm: Some(round3(metrics.width_mm)),
        depth_mm: Some(round3(metrics.depth_mm)),
        height_mm: Some(round3(metrics.height_mm)),
        volume_cm3: Some(round3(volume_cm3)),
        surface_area_cm2: Some(round3(surface_area_cm2)),
        object_count: Some(1),
        complexity_score: Some(score),
        difficulty_level: Some(difficulty_for(score).to_string()),
        ..NormalizedMetadata::default()
    };

    Ok(ParsedFile {
        meta,
        thumbnail: None,
    })
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

pub fn analyze(bytes: &[u8]) -> Result<MeshMetrics> {
    let triangles = if is_binary(bytes) {
        parse_binary(bytes)?
    } else {
        parse_ascii(bytes)?
    };
    if triangles.is_empty() {
        return Err(ServiceError::Integrity("empty mesh".into()));
    }
    Ok(compute_metrics(&triangles))
}

/// Binary STL: 80-byte header, u32 triangle count, then 50 bytes per
/// triangle. An ASCII file starts with "solid" and contains "facet".
fn is_binary(bytes: &[u8]) -> bool {
    if bytes.len() < 84 {
        return false;
    }
    let declared = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    if bytes.len() == 84 + declared * 50 {
        return true;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]);
    !(head.trim_start().starts_with("solid") && head.contains("facet"))
}

fn parse_binary(bytes: &[u8]) -> Result<Vec<Triangle>> {
    if bytes.len() < 84 {
        return Err(ServiceError::Integrity("truncated binary STL".into()));
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let expected = 84 + count * 50;
    if bytes.len() < expected {
        return Err(ServiceError::Integrity(format!(
            "binary STL declares {count} triangles but is truncated"
        )));
    }

    let mut triangles = Vec::with_capacity(count);
    for i in 0..count {
        let base = 84 + i * 50;
        let mut vertices = [[0.0f64; 3]; 3];
        for (v, vertex) in vertices.iter_mut().enumerate() {
            for (axis, value) in vertex.iter_mut().enumerate() {
                // Skip the 12-byte normal; vertices follow it.
                let offset = base + 12 + v * 12 + axis * 4;
                let raw = f32::from_le_bytes([
                    bytes[offset],
                    bytes[offset + 1],
                    bytes[offset + 2],
                    bytes[offset + 3],
                ]);
                *value = raw as f64;
            }
        }
        triangles.push(Triangle { vertices });
    }
    Ok(triangles)
}

fn parse_ascii(bytes: &[u8]) -> Result<Vec<Triangle>> {
    let text = String::from_utf8_lossy(bytes);
    let mut triangles = Vec::new();
    let mut current: Vec<[f64; 3]> = Vec::with_capacity(3);

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("vertex") {
            let coords: Vec<f64> = rest
                .split_whitespace()
                .filter_map(|t| t.parse().ok())
                .collect();
            if coords.len() != 3 {
                return Err(ServiceError::Integrity(format!(
                    "malformed STL vertex line: {line}"
                )));
            }
            current.push([coords[0], coords[1], coords[2]]);
            if current.len() == 3 {
                triangles.push(Triangle {
                    vertices: [current[0], current[1], current[2]],
                });
                current.clear();
            }
        } else if line.starts_with("endfacet") {
            current.clear();
        }
    }
    Ok(triangles)
}

/// Quantize a coordinate so vertices that differ only by float noise
/// share an identity.
fn quantize(v: [f64; 3]) -> (i64, i64, i64) {
    const SCALE: f64 = 1.0e6;
    (
        (v[0] * SCALE).round() as i64,
        (v[1] * SCALE).round() as i64,
        (v[2] * SCALE).round() as i64,
    )
}

fn compute_metrics(triangles: &[Triangle]) -> MeshMetrics {
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    let mut volume = 0.0f64;
    let mut area = 0.0f64;

    let mut vertex_ids: HashMap<(i64, i64, i64), usize> = HashMap::new();
    let mut edge_use: HashMap<(usize, usize), u32> = HashMap::new();

    for triangle in triangles {
        let [a, b, c] = triangle.vertices;
        for vertex in [a, b, c] {
            for axis in 0..3 {
                min[axis] = min[axis].min(vertex[axis]);
                max[axis] = max[axis].max(vertex[axis]);
            }
        }

        // Signed tetrahedron volume against the origin.
        volume += dot(a, cross(b, c)) / 6.0;
        area += norm(cross(sub(b, a), sub(c, a))) / 2.0;

        let ids: Vec<usize> = [a, b, c]
            .iter()
            .map(|v| {
                let next = vertex_ids.len();
                *vertex_ids.entry(quantize(*v)).or_insert(next)
            })
            .collect();
        for (i, j) in [(0, 1), (1, 2), (2, 0)] {
            let edge = (ids[i].min(ids[j]), ids[i].max(ids[j]));
            *edge_use.entry(edge).or_insert(0) += 1;
        }
    }

    let has_open_edges = edge_use.values().any(|&uses| uses == 1);
    let watertight = edge_use.values().all(|&uses| uses == 2);

    MeshMetrics {
        vertex_count: vertex_ids.len(),
        face_count: triangles.len(),
        width_mm: max[0] - min[0],
        depth_mm: max[1] - min[1],
        height_mm: max[2] - min[2],
        volume_mm3: volume.abs(),
        surface_area_mm2: area,
        watertight,
        has_holes: has_open_edges,
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A unit cube as 12 binary STL triangles.
    fn cube_binary() -> Vec<u8> {
        let v = |x: f64, y: f64, z: f64| [x, y, z];
        let quads = [
            // bottom (z=0), top (z=1)
            [v(0., 0., 0.), v(1., 0., 0.), v(1., 1., 0.), v(0., 1., 0.)],
            [v(0., 0., 1.), v(0., 1., 1.), v(1., 1., 1.), v(1., 0., 1.)],
            // front (y=0), back (y=1)
            [v(0., 0., 0.), v(0., 0., 1.), v(1., 0., 1.), v(1., 0., 0.)],
            [v(0., 1., 0.), v(1., 1., 0.), v(1., 1., 1.), v(0., 1., 1.)],
            // left (x=0), right (x=1)
            [v(0., 0., 0.), v(0., 1., 0.), v(0., 1., 1.), v(0., 0., 1.)],
            [v(1., 0., 0.), v(1., 0., 1.), v(1., 1., 1.), v(1., 1., 0.)],
        ];

        let mut triangles: Vec<[[f64; 3]; 3]> = Vec::new();
        for [a, b, c, d] in quads {
            triangles.push([a, b, c]);
            triangles.push([a, c, d]);
        }

        let mut bytes = vec![0u8; 80];
        bytes.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
        for triangle in &triangles {
            bytes.extend_from_slice(&[0u8; 12]); // normal
            for vertex in triangle {
                for axis in vertex {
                    bytes.extend_from_slice(&(*axis as f32).to_le_bytes());
                }
            }
            bytes.extend_from_slice(&[0u8; 2]); // attribute count
        }
        bytes
    }

    #[test]
    fn binary_cube_measures_correctly() {
        let metrics = analyze(&cube_binary()).unwrap();
        assert_eq!(metrics.face_count, 12);
        assert_eq!(metrics.vertex_count, 8);
        assert!((metrics.volume_mm3 - 1.0).abs() < 1e-9);
        assert!((metrics.surface_area_mm2 - 6.0).abs() < 1e-9);
        assert!((metrics.width_mm - 1.0).abs() < 1e-9);
        assert!(metrics.watertight);
        assert!(!metrics.has_holes);
    }

    #[test]
    fn missing_face_breaks_watertightness() {
        let mut bytes = cube_binary();
        // Drop the last triangle.
        bytes.truncate(bytes.len() - 50);
        let count = 11u32;
        bytes[80..84].copy_from_slice(&count.to_le_bytes());

        let metrics = analyze(&bytes).unwrap();
        assert!(!metrics.watertight);
        assert!(metrics.has_holes);
    }

    #[test]
    fn ascii_tetrahedron_parses() {
        let stl = "\
solid tet
 facet normal 0 0 0
  outer loop
   vertex 0 0 0
   vertex 1 0 0
   vertex 0 1 0
  endloop
 endfacet
 facet normal 0 0 0
  outer loop
   vertex 0 0 0
   vertex 1 0 0
   vertex 0 0 1
  endloop
 endfacet
 facet normal 0 0 0
  outer loop
   vertex 0 0 0
   vertex 0 1 0
   vertex 0 0 1
  endloop
 endfacet
 facet normal 0 0 0
  outer loop
   vertex 1 0 0
   vertex 0 1 0
   vertex 0 0 1
  endloop
 endfacet
endsolid tet
";
        let metrics = analyze(stl.as_bytes()).unwrap();
        assert_eq!(metrics.face_count, 4);
        assert_eq!(metrics.vertex_count, 4);
        assert!(metrics.watertight);
        assert!((metrics.volume_mm3 - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let mut bytes = cube_binary();
        bytes.truncate(100);
        assert!(analyze(&bytes).is_err());
    }

    #[test]
    fn parse_writes_normalized_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.stl");
        std::fs::write(&path, cube_binary()).unwrap();

        let parsed = parse(&path).unwrap();
        assert_eq!(parsed.meta.width_mm, Some(1.0));
        assert_eq!(parsed.meta.volume_cm3, Some(0.001));
        // 8 vertices → low-poly deduction; high SA/V ratio adds one.
        assert!(parsed.meta.complexity_score.is_some());
        assert!(parsed.meta.difficulty_level.is_some());
        assert!(parsed.thumbnail.is_none());
    }
}
