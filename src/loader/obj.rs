//! Wavefront OBJ meshes. Only `v` and `f` records are read; polygons are
//! fan-triangulated.

use std::str;

use super::{LoadContext, Loader};
use crate::errors::LoadError;
use crate::param::Blob;
use crate::scene::{Geometry, Model, TriangleMesh, Vec3};

const PROGRESS_STEPS: usize = 100;

#[derive(Default)]
pub struct ObjLoader;

impl ObjLoader {
    pub fn new() -> Self {
        Self
    }
}

impl Loader for ObjLoader {
    fn name(&self) -> &str {
        "obj"
    }

    fn supported_types(&self) -> Vec<String> {
        vec!["obj".to_owned()]
    }

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

        let mut mesh = TriangleMesh::default();
        for (i, line) in lines.iter().enumerate() {
            ctx.check()?;
            let invalid = || {
                LoadError::Invalid(format!(
                    "Invalid content in line {}: {}",
                    i + 1,
                    line
                ))
            };

            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("v") => {
                    let coords: Option<Vec<f32>> =
                        tokens.take(3).map(|t| t.parse().ok()).collect();
                    match coords.as_deref() {
                        Some(&[x, y, z]) => {
                            mesh.vertices.push(Vec3::new(x, y, z))
                        }
                        _ => return Err(invalid()),
                    }
                }
                Some("f") => {
                    let corners: Option<Vec<u32>> = tokens
                        .map(|t| resolve_index(t, mesh.vertices.len()))
                        .collect();
                    let corners = corners.ok_or_else(invalid)?;
                    if corners.len() < 3 {
                        return Err(invalid());
                    }
                    for k in 1..corners.len() - 1 {
                        mesh.indices.push([
                            corners[0],
                            corners[k],
                            corners[k + 1],
                        ]);
                    }
                }
                _ => {}
            }

            if i % step == 0 {
                ctx.progress(
                    "Loading mesh ...",
                    (i + 1) as f64 / lines.len() as f64,
                )?;
            }
        }
        log::debug!(
            "obj/{}: {} vertices, {} triangles",
            blob.name,
            mesh.vertices.len(),
            mesh.indices.len()
        );

        Ok(Model {
            name: blob.name,
            type_tag: blob.type_tag,
            geometry: Geometry::Mesh(mesh),
        })
    }
}

/// Zero-based vertex index of a face corner such as `3`, `3/1/2` or `-1`.
fn resolve_index(token: &str, vertex_count: usize) -> Option<u32> {
    let raw: i64 = token.split('/').next()?.parse().ok()?;
    let index = match raw {
        0 => return None,
        r if r > 0 => r - 1,
        r => vertex_count as i64 + r,
    };
    if index < 0 || index >= vertex_count as i64 {
        return None;
    }
    u32::try_from(index).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::progress::Progress;
    use rstest::rstest;

    fn load(text: &str) -> Result<Model, LoadError> {
        let progress = Progress::new("");
        let phase = progress.phase(1.0);
        let token = CancellationToken::new();
        let ctx = LoadContext::new(&phase, &token);
        ObjLoader::new().load_blob(
            Blob {
                type_tag: "obj".to_owned(),
                name: "quad".to_owned(),
                bytes: text.as_bytes().to_vec(),
            },
            &ctx,
        )
    }

    #[test]
    fn quad_is_fan_triangulated() {
        let model = load(
            "# quad\nv 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nvn 0 0 1\n\
             f 1//1 2//1 3//1 4//1\n",
        )
        .unwrap();
        match model.geometry {
            Geometry::Mesh(mesh) => {
                assert_eq!(mesh.vertices.len(), 4);
                assert_eq!(mesh.indices, vec![[0, 1, 2], [0, 2, 3]]);
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn negative_indices_are_relative() {
        let model = load("v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n").unwrap();
        assert_eq!(model.geometry.primitive_count(), 1);
    }

    #[rstest]
    #[case("v 0 0\n")]
    #[case("v 0 0 0\nf 1 2 3\n")]
    #[case("v 0 0 0\nv 1 0 0\nf 1 2\n")]
    #[case("v 0 0 0\nf 0 1 1\n")]
    fn malformed_records(#[case] text: &str) {
        assert!(matches!(load(text), Err(LoadError::Invalid(_))));
    }
}
