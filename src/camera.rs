//! Camera extrinsics and relative pose embeddings
//!
//! A trajectory of target cameras is expressed relative to the first
//! condition camera; each pose keeps the top 3x4 of the relative transform,
//! flattened to the 12-wide camera embedding consumed by the DiT.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

pub type Mat4 = [[f64; 4]; 4];

/// Frame positions sampled from a source trajectory
pub const TRAJECTORY_LAST_FRAME: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("cannot parse camera matrix '{0}'")]
    Parse(String),

    #[error("unexpected camera matrix shape {rows}x{cols}")]
    Shape { rows: usize, cols: usize },

    #[error("camera matrix is singular")]
    Singular,

    #[error("no extrinsics for frame {frame} of view {view}")]
    MissingFrame { frame: usize, view: usize },

    #[error("failed to read camera extrinsics: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse camera extrinsics: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub fn identity4() -> Mat4 {
    let mut m = [[0.0; 4]; 4];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}

pub fn matmul4(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            out[i][j] = (0..4).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// Gauss-Jordan inverse with partial pivoting
pub fn invert4(m: &Mat4) -> Result<Mat4, CameraError> {
    let mut a = *m;
    let mut inv = identity4();
    for col in 0..4 {
        let pivot = (col..4)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(CameraError::Singular);
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let p = a[col][col];
        for j in 0..4 {
            a[col][j] /= p;
            inv[col][j] /= p;
        }
        for row in 0..4 {
            if row == col {
                continue;
            }
            let f = a[row][col];
            if f == 0.0 {
                continue;
            }
            for j in 0..4 {
                a[row][j] -= f * a[col][j];
                inv[row][j] -= f * inv[col][j];
            }
        }
    }
    Ok(inv)
}

/// Parse `"[a b c d] [e f g h] ..."` into rows of floats
pub fn parse_matrix(s: &str) -> Result<Vec<Vec<f64>>, CameraError> {
    s.trim()
        .split("] [")
        .map(|row| {
            row.replace(['[', ']'], "")
                .split_whitespace()
                .map(|v| v.parse::<f64>().map_err(|_| CameraError::Parse(s.to_string())))
                .collect()
        })
        .collect()
}

/// Promote a 3x4 matrix with `[0, 0, 0, 1]`; anything but 3x4 or 4x4 is rejected.
pub fn to_homogeneous(rows: &[Vec<f64>]) -> Result<Mat4, CameraError> {
    let cols = rows.first().map_or(0, Vec::len);
    if !(rows.len() == 3 || rows.len() == 4) || rows.iter().any(|r| r.len() != 4) {
        return Err(CameraError::Shape {
            rows: rows.len(),
            cols,
        });
    }
    let mut m = identity4();
    for (i, row) in rows.iter().enumerate() {
        m[i].copy_from_slice(row);
    }
    Ok(m)
}

/// Camera with its camera-to-world transform and inverse
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub c2w: Mat4,
    pub w2c: Mat4,
}

impl Camera {
    pub fn new(c2w: Mat4) -> Result<Self, CameraError> {
        Ok(Self {
            w2c: invert4(&c2w)?,
            c2w,
        })
    }

    pub fn from_str_matrix(s: &str) -> Result<Self, CameraError> {
        Self::new(to_homogeneous(&parse_matrix(s)?)?)
    }

    /// Pose of `self` in the frame of `reference`
    pub fn relative_to(&self, reference: &Camera) -> Mat4 {
        matmul4(&reference.w2c, &self.c2w)
    }
}

/// Top 3x4 of each target pose relative to `reference`, row-major
pub fn relative_poses(reference: &Camera, targets: &[Camera]) -> Vec<[f32; 12]> {
    targets
        .iter()
        .map(|cam| {
            let rel = cam.relative_to(reference);
            let mut out = [0f32; 12];
            for r in 0..3 {
                for c in 0..4 {
                    out[r * 4 + c] = rel[r][c] as f32;
                }
            }
            out
        })
        .collect()
}

/// `[T, 12]` camera embedding
pub fn pose_embedding(poses: &[[f32; 12]], device: &Device) -> candle_core::Result<Tensor> {
    let flat: Vec<f32> = poses.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (poses.len(), 12), device)
}

/// `n` frame indices spread evenly over `0..=last`, truncated toward zero
pub fn sample_frame_indices(n: usize, last: usize) -> Vec<usize> {
    match n {
        0 => Vec::new(),
        1 => vec![0],
        _ => {
            let step = last as f64 / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { last } else { (i as f64 * step) as usize })
                .collect()
        }
    }
}

/// `camera_extrinsics.json`: `frame{i}` → `cam{vv}` → matrix string
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(transparent)]
pub struct CameraExtrinsics {
    frames: HashMap<String, HashMap<String, String>>,
}

impl CameraExtrinsics {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn camera(&self, frame: usize, view: usize) -> Result<Camera, CameraError> {
        let s = self
            .frames
            .get(&format!("frame{frame}"))
            .and_then(|f| f.get(&format!("cam{view:02}")))
            .ok_or(CameraError::MissingFrame { frame, view })?;
        Camera::from_str_matrix(s)
    }

    pub fn trajectory(&self, view: usize, frames: &[usize]) -> Result<Vec<Camera>, CameraError> {
        frames.iter().map(|&f| self.camera(f, view)).collect()
    }

    /// Target view poses relative to the first condition view camera, sampled
    /// at `target_len` evenly spaced frames. Returns `[target_len, 12]`.
    pub fn relative_embedding(
        &self,
        condition_view: usize,
        target_view: usize,
        target_len: usize,
        device: &Device,
    ) -> Result<Tensor, CameraError> {
        let frames = sample_frame_indices(target_len, TRAJECTORY_LAST_FRAME);
        let cond = self.trajectory(condition_view, &frames)?;
        let tgt = self.trajectory(target_view, &frames)?;
        let reference = cond.first().ok_or(CameraError::MissingFrame {
            frame: 0,
            view: condition_view,
        })?;
        Ok(pose_embedding(&relative_poses(reference, &tgt), device)?)
    }
}
