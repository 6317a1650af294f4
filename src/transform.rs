//! Spatial transform handles
//!
//! A `Transform` always remembers the (source, reference) pair it was
//! computed from, so chains can be checked for matching endpoints before
//! they are handed to a resampling tool.

use crate::error::{CestError, CestResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Affine,
    Nonlinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformDirection {
    Forward,
    Inverse,
}

/// Handle to a transform artifact on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub path: PathBuf,
    pub kind: TransformKind,
    pub direction: TransformDirection,
    /// Space the transform starts from
    pub source: PathBuf,
    /// Space the transform ends in
    pub reference: PathBuf,
}

impl Transform {
    pub fn new(
        path: impl Into<PathBuf>,
        kind: TransformKind,
        direction: TransformDirection,
        source: impl Into<PathBuf>,
        reference: impl Into<PathBuf>,
    ) -> Self {
        Self {
            path: path.into(),
            kind,
            direction,
            source: source.into(),
            reference: reference.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Space data is in before the transform is applied
    pub fn from_space(&self) -> &Path {
        match self.direction {
            TransformDirection::Forward => &self.source,
            TransformDirection::Inverse => &self.reference,
        }
    }

    /// Space data is in after the transform is applied
    pub fn to_space(&self) -> &Path {
        match self.direction {
            TransformDirection::Forward => &self.reference,
            TransformDirection::Inverse => &self.source,
        }
    }

    /// Same artifact, traversed from reference back to source
    pub fn reversed(&self) -> Transform {
        let direction = match self.direction {
            TransformDirection::Forward => TransformDirection::Inverse,
            TransformDirection::Inverse => TransformDirection::Forward,
        };
        Transform {
            direction,
            ..self.clone()
        }
    }

    /// Read the matrix of an affine transform file
    pub fn read_affine(&self) -> CestResult<Affine12> {
        if self.kind != TransformKind::Affine {
            return Err(CestError::TransformChain(format!(
                "{} is not an affine transform",
                self.path.display()
            )));
        }
        let text = std::fs::read_to_string(&self.path)?;
        Affine12::parse(&text)
    }
}

/// Ordered chain of transforms from subject space to template space
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformChain {
    transforms: Vec<Transform>,
}

impl TransformChain {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    pub fn push(&mut self, transform: Transform) {
        self.transforms.push(transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Check the chain is non-empty and adjacent endpoints agree
    pub fn validate(&self) -> CestResult<()> {
        if self.transforms.is_empty() {
            return Err(CestError::TransformChain("transform chain is empty".to_string()));
        }
        for pair in self.transforms.windows(2) {
            if pair[0].to_space() != pair[1].from_space() {
                return Err(CestError::TransformChain(format!(
                    "{} ends in {} but {} starts from {}",
                    pair[0].path.display(),
                    pair[0].to_space().display(),
                    pair[1].path.display(),
                    pair[1].from_space().display()
                )));
            }
        }
        Ok(())
    }

    /// Warp specification for a single resampling pass.
    ///
    /// Warp tools compose coordinate mappings right to left, so the
    /// transform applied first to subject data is written last. Inverse
    /// transforms are wrapped as `INV(<path>)`.
    pub fn warp_spec(&self) -> CestResult<String> {
        self.validate()?;
        let parts: Vec<String> = self
            .transforms
            .iter()
            .rev()
            .map(|t| {
                let path = t.path.to_string_lossy();
                match t.direction {
                    TransformDirection::Forward => path.to_string(),
                    TransformDirection::Inverse => format!("INV({})", path),
                }
            })
            .collect();
        Ok(parts.join(" "))
    }
}

/// Path of one warp specification token and whether it is inverted
pub fn spec_token(token: &str) -> (&str, bool) {
    match token
        .strip_prefix("INV(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        Some(path) => (path, true),
        None => (token, false),
    }
}

/// 3x4 affine matrix in the row-major one-line layout of `.aff12.1D` files
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine12 {
    pub m: [[f64; 4]; 3],
}

impl Affine12 {
    pub fn identity() -> Self {
        Self {
            m: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
        }
    }

    pub fn translation(dx: f64, dy: f64, dz: f64) -> Self {
        let mut affine = Self::identity();
        affine.m[0][3] = dx;
        affine.m[1][3] = dy;
        affine.m[2][3] = dz;
        affine
    }

    /// Parse the last 12 numbers of a matrix text; comment lines start with `#`
    pub fn parse(text: &str) -> CestResult<Self> {
        let values: Vec<f64> = text
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .flat_map(|line| line.split_whitespace())
            .filter_map(|token| token.parse::<f64>().ok())
            .collect();
        if values.len() < 12 {
            return Err(CestError::TransformChain(format!(
                "expected 12 matrix values, found {}",
                values.len()
            )));
        }
        let tail = &values[values.len() - 12..];
        let mut m = [[0.0; 4]; 3];
        for (i, value) in tail.iter().enumerate() {
            m[i / 4][i % 4] = *value;
        }
        Ok(Self { m })
    }

    pub fn to_oneline(&self) -> String {
        self.m
            .iter()
            .flat_map(|row| row.iter())
            .map(|v| format!("{}", v))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn translation_part(&self) -> [f64; 3] {
        [self.m[0][3], self.m[1][3], self.m[2][3]]
    }

    /// `self ∘ other`: apply `other` first
    pub fn compose(&self, other: &Affine12) -> Affine12 {
        let mut m = [[0.0; 4]; 3];
        for r in 0..3 {
            for c in 0..4 {
                let mut sum: f64 = (0..3).map(|k| self.m[r][k] * other.m[k][c]).sum();
                if c == 3 {
                    sum += self.m[r][3];
                }
                m[r][c] = sum;
            }
        }
        Affine12 { m }
    }

    pub fn inverse(&self) -> CestResult<Affine12> {
        let a = &self.m;
        let det = a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
            - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
            + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]);
        if det.abs() < 1e-12 {
            return Err(CestError::TransformChain("singular affine matrix".to_string()));
        }
        let mut inv = [[0.0; 4]; 3];
        inv[0][0] = (a[1][1] * a[2][2] - a[1][2] * a[2][1]) / det;
        inv[0][1] = (a[0][2] * a[2][1] - a[0][1] * a[2][2]) / det;
        inv[0][2] = (a[0][1] * a[1][2] - a[0][2] * a[1][1]) / det;
        inv[1][0] = (a[1][2] * a[2][0] - a[1][0] * a[2][2]) / det;
        inv[1][1] = (a[0][0] * a[2][2] - a[0][2] * a[2][0]) / det;
        inv[1][2] = (a[0][2] * a[1][0] - a[0][0] * a[1][2]) / det;
        inv[2][0] = (a[1][0] * a[2][1] - a[1][1] * a[2][0]) / det;
        inv[2][1] = (a[0][1] * a[2][0] - a[0][0] * a[2][1]) / det;
        inv[2][2] = (a[0][0] * a[1][1] - a[0][1] * a[1][0]) / det;
        for r in 0..3 {
            inv[r][3] = -(0..3).map(|k| inv[r][k] * a[k][3]).sum::<f64>();
        }
        Ok(Affine12 { m: inv })
    }

    pub fn approx_eq(&self, other: &Affine12, tol: f64) -> bool {
        self.m
            .iter()
            .flatten()
            .zip(other.m.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(path: &str, source: &str, reference: &str) -> Transform {
        Transform::new(
            path,
            TransformKind::Affine,
            TransformDirection::Forward,
            source,
            reference,
        )
    }

    #[test]
    fn test_empty_chain_rejected() {
        let chain = TransformChain::default();
        assert!(matches!(chain.validate(), Err(CestError::TransformChain(_))));
        assert!(chain.warp_spec().is_err());
    }

    #[test]
    fn test_chain_endpoints_must_match() {
        let chain = TransformChain::new(vec![t("a.1D", "anat", "cest"), t("b.1D", "anat", "tpl")]);
        assert!(chain.validate().is_err());
    }

    #[test]
    fn test_reversed_transform_swaps_spaces() {
        let coreg = t("/o/coreg.aff12.1D", "anat", "cest");
        let reversed = coreg.reversed();
        assert_eq!(reversed.from_space(), Path::new("cest"));
        assert_eq!(reversed.to_space(), Path::new("anat"));
        assert_eq!(reversed.reversed(), coreg);

        let chain = TransformChain::new(vec![reversed, t("/o/aff.1D", "anat", "template")]);
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_warp_spec_is_reversed() {
        let chain = TransformChain::new(vec![
            t("/o/coreg.aff12.1D", "cest", "anat"),
            t("/o/affine.aff12.1D", "anat", "anat_aff"),
            t("/o/anat_WARP.nii", "anat_aff", "template"),
        ]);
        assert_eq!(
            chain.warp_spec().unwrap(),
            "/o/anat_WARP.nii /o/affine.aff12.1D /o/coreg.aff12.1D"
        );
    }

    #[test]
    fn test_warp_spec_inverts_reversed_transforms() {
        let coreg = t("/o/anat_to_cest.aff12.1D", "anat", "cest");
        let chain = TransformChain::new(vec![
            coreg.reversed(),
            t("/o/affine.aff12.1D", "anat", "anat_aff"),
        ]);
        assert_eq!(
            chain.warp_spec().unwrap(),
            "/o/affine.aff12.1D INV(/o/anat_to_cest.aff12.1D)"
        );

        let tokens: Vec<(&str, bool)> = "/o/affine.aff12.1D INV(/o/anat_to_cest.aff12.1D)"
            .split_whitespace()
            .map(spec_token)
            .collect();
        assert_eq!(
            tokens,
            vec![("/o/affine.aff12.1D", false), ("/o/anat_to_cest.aff12.1D", true)]
        );
    }

    #[test]
    fn test_parse_oneline_with_comment() {
        let text = "# 3dAllineate matrix\n1 0 0 2.5 0 1 0 -1 0 0 1 0\n";
        let affine = Affine12::parse(text).unwrap();
        assert_eq!(affine.translation_part(), [2.5, -1.0, 0.0]);
        assert_eq!(Affine12::parse(&affine.to_oneline()).unwrap(), affine);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(Affine12::parse("1 0 0").is_err());
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let affine = Affine12 {
            m: [
                [0.0, -1.0, 0.0, 3.0],
                [1.0, 0.0, 0.0, -2.0],
                [0.0, 0.0, 2.0, 1.0],
            ],
        };
        let inverse = affine.inverse().unwrap();
        assert!(affine.compose(&inverse).approx_eq(&Affine12::identity(), 1e-9));
        assert!(inverse.compose(&affine).approx_eq(&Affine12::identity(), 1e-9));
    }

    #[test]
    fn test_singular_inverse_fails() {
        let mut affine = Affine12::identity();
        affine.m[2][2] = 0.0;
        assert!(affine.inverse().is_err());
    }
}
