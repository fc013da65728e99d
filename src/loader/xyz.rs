//! Point clouds: ASCII `xyz` and binary `xyzb`, one sphere per point.

use std::str;

use super::{LoadContext, Loader};
use crate::errors::LoadError;
use crate::param::Blob;
use crate::scene::{Geometry, Model, Sphere, Vec3};

const PROGRESS_STEPS: usize = 100;
const POINT_BYTES: usize = 3 * std::mem::size_of::<f64>();

pub struct XyzLoader {
    radius: f32,
}

impl XyzLoader {
    pub fn new(radius: f32) -> Self {
        Self { radius }
    }
}

impl Loader for XyzLoader {
    fn name(&self) -> &str {
        "xyz"
    }

    fn supported_types(&self) -> Vec<String> {
        vec!["xyz".to_owned()]
    }

    /// Three whitespace separated floats per line; blank lines are skipped.
    fn load_blob(
        &self,
        blob: Blob,
        ctx: &LoadContext<'_>,
    ) -> Result<Model, LoadError> {
        let text = str::from_utf8(&blob.bytes).map_err(|e| {
            LoadError::Invalid(format!("Invalid content: {}", e))
        })?;
        let lines: Vec<&str> = text.lines().collect();
        let step = (lines.len() / PROGRESS_STEPS).max(1);

        let mut spheres = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            ctx.check()?;
            if line.trim().is_empty() {
                continue;
            }
            let values: Option<Vec<f32>> = line
                .split_whitespace()
                .map(|token| token.parse().ok())
                .collect();
            match values.as_deref() {
                Some(&[x, y, z]) => spheres.push(Sphere {
                    center: Vec3::new(x, y, z),
                    radius: self.radius,
                }),
                _ => {
                    return Err(LoadError::Invalid(format!(
                        "Invalid content in line {}: {}",
                        i + 1,
                        line
                    )))
                }
            }
            if i % step == 0 {
                ctx.progress(
                    "Loading spheres ...",
                    (i + 1) as f64 / lines.len() as f64,
                )?;
            }
        }
        log::debug!("xyz/{}: {} points", blob.name, spheres.len());

        Ok(Model {
            name: blob.name,
            type_tag: blob.type_tag,
            geometry: Geometry::Spheres(spheres),
        })
    }
}

pub struct XyzbLoader {
    radius: f32,
}

impl XyzbLoader {
    pub fn new(radius: f32) -> Self {
        Self { radius }
    }
}

impl Loader for XyzbLoader {
    fn name(&self) -> &str {
        "xyzb"
    }

    fn supported_types(&self) -> Vec<String> {
        vec!["xyzb".to_owned()]
    }

    /// Little-endian `f64` triples, no header.
    fn load_blob(
        &self,
        blob: Blob,
        ctx: &LoadContext<'_>,
    ) -> Result<Model, LoadError> {
        if blob.bytes.len() % POINT_BYTES != 0 {
            return Err(LoadError::Invalid(format!(
                "Invalid content: {} bytes is not a multiple of {}",
                blob.bytes.len(),
                POINT_BYTES
            )));
        }
        let count = blob.bytes.len() / POINT_BYTES;
        let step = (count / PROGRESS_STEPS).max(1);

        let mut spheres = Vec::with_capacity(count);
        for (i, point) in blob.bytes.chunks_exact(POINT_BYTES).enumerate() {
            ctx.check()?;
            let coord = |k: usize| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&point[k * 8..(k + 1) * 8]);
                f64::from_le_bytes(raw) as f32
            };
            spheres.push(Sphere {
                center: Vec3::new(coord(0), coord(1), coord(2)),
                radius: self.radius,
            });
            if i % step == 0 {
                ctx.progress(
                    "Loading spheres ...",
                    (i + 1) as f64 / count as f64,
                )?;
            }
        }
        log::debug!("xyzb/{}: {} points", blob.name, spheres.len());

        Ok(Model {
            name: blob.name,
            type_tag: blob.type_tag,
            geometry: Geometry::Spheres(spheres),
        })
    }
}
