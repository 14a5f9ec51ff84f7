//! Serializable model description.
//!
//! Real-valued weights and samples are quantized when the graph is loaded, so
//! a JSON file stays readable and independent of the fixed-point format.

use crate::errors::{EngineError, Result};
use crate::recovery::encoding::LEGAL_MAX;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Name under which nodes refer to the test sample.
pub const INPUT_NAME: &str = "input";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Dimensions of one test sample, `[1, C, H, W]` for image inputs
    pub input: Vec<u16>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub nodes: Vec<NodeSpec>,
    /// Test samples, real values in `[-1, 1]`
    #[serde(default)]
    pub samples: Vec<Vec<f64>>,
    /// Expected class per sample; may be empty
    #[serde(default)]
    pub labels: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub dims: Vec<u16>,
    /// 16 = Q15, 32 = accumulator scale (Q30), 64 = plain integers
    #[serde(default = "default_bitwidth")]
    pub bitwidth: u8,
    pub values: Vec<f64>,
    /// Matrix stored as `[N, K]` instead of `[K, N]`
    #[serde(default)]
    pub transposed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub op: String,
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_size: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<u8>,
}

fn default_bitwidth() -> u8 {
    16
}

/// Quantize real parameter values for a given bit width.
pub fn quantize(values: &[f64], bitwidth: u8) -> Result<Vec<i64>> {
    let scaled = |v: f64, scale: f64, lo: i64, hi: i64| -> i64 {
        ((v * scale).round() as i64).clamp(lo, hi)
    };
    match bitwidth {
        16 => Ok(values
            .iter()
            .map(|&v| scaled(v, 32768.0, i16::MIN as i64, i16::MAX as i64))
            .collect()),
        32 => Ok(values
            .iter()
            .map(|&v| scaled(v, (1u64 << 30) as f64, i32::MIN as i64, i32::MAX as i64))
            .collect()),
        64 => Ok(values.iter().map(|&v| v.round() as i64).collect()),
        other => Err(EngineError::Validation(format!(
            "unsupported bit width {}",
            other
        ))),
    }
}

/// Map a real sample value into the legal stored range.
pub fn quantize_sample(value: f64) -> i16 {
    let max = LEGAL_MAX as f64;
    (value * max).round().clamp(-max, max) as i16
}

impl ModelSpec {
    pub fn builder(name: &str, input: &[u16]) -> ModelBuilder {
        ModelBuilder {
            spec: ModelSpec {
                name: name.to_string(),
                input: input.to_vec(),
                parameters: Vec::new(),
                nodes: Vec::new(),
                samples: Vec::new(),
                labels: Vec::new(),
            },
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let spec = Self::from_json(&contents)?;
        tracing::debug!(path = %path.display(), model = %spec.name, "Model description loaded");
        Ok(spec)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Small digit-like classifier used when no model file is given.
    ///
    /// `input[1,1,8,8] -> Conv(4x3x3) -> Relu -> MaxPool(2) -> Reshape[1,36]
    /// -> MatMul(36x4) -> Add`, with four samples (horizontal bar, vertical
    /// bar, diagonal, centre blob), one per class.
    pub fn demo() -> Self {
        const FILTERS: [[f64; 9]; 4] = [
            [-0.12, -0.12, -0.12, 0.25, 0.25, 0.25, -0.12, -0.12, -0.12],
            [-0.12, 0.25, -0.12, -0.12, 0.25, -0.12, -0.12, 0.25, -0.12],
            [0.25, -0.12, -0.12, -0.12, 0.25, -0.12, -0.12, -0.12, 0.25],
            [0.0, 0.06, 0.0, 0.06, 0.25, 0.06, 0.0, 0.06, 0.0],
        ];
        let conv_w: Vec<f64> = FILTERS.iter().flatten().copied().collect();

        // pooled map is [4, 3, 3] stored channel-tiled: channel = position % 4
        let mut fc_w = Vec::with_capacity(36 * 4);
        for k in 0..36 {
            for n in 0..4 {
                fc_w.push(if k % 4 == n { 0.5 } else { -0.1 });
            }
        }

        let bar = |f: &dyn Fn(usize, usize) -> bool| -> Vec<f64> {
            (0..64)
                .map(|i| if f(i / 8, i % 8) { 0.9 } else { 0.0 })
                .collect()
        };

        ModelSpec::builder("demo", &[1, 1, 8, 8])
            .parameter("conv_w", &[4, 1, 3, 3], conv_w)
            .parameter("conv_b", &[4], vec![0.0; 4])
            .parameter_with("shape", &[2], 64, vec![1.0, -1.0], false)
            .parameter("fc_w", &[36, 4], fc_w)
            .parameter("fc_b", &[4], vec![0.01, 0.0, 0.0, -0.01])
            .node_with("conv", "Conv", &["input", "conv_w", "conv_b"], None, Some(1))
            .node("relu", "Relu", &["conv"])
            .node_with("pool", "MaxPool", &["relu"], Some(2), Some(2))
            .node("flatten", "Reshape", &["pool", "shape"])
            .node("fc", "MatMul", &["flatten", "fc_w"])
            .node("logits", "Add", &["fc", "fc_b"])
            .sample(bar(&|h, _| h == 3 || h == 4), 0)
            .sample(bar(&|_, w| w == 3 || w == 4), 1)
            .sample(bar(&|h, w| h == w || h == w + 1), 2)
            .sample(bar(&|h, w| (2..6).contains(&h) && (2..6).contains(&w)), 3)
            .build()
    }
}

/// Incremental construction of a [`ModelSpec`].
pub struct ModelBuilder {
    spec: ModelSpec,
}

impl ModelBuilder {
    /// 16-bit parameter.
    pub fn parameter(self, name: &str, dims: &[u16], values: Vec<f64>) -> Self {
        self.parameter_with(name, dims, 16, values, false)
    }

    pub fn parameter_with(
        mut self,
        name: &str,
        dims: &[u16],
        bitwidth: u8,
        values: Vec<f64>,
        transposed: bool,
    ) -> Self {
        self.spec.parameters.push(ParameterSpec {
            name: name.to_string(),
            dims: dims.to_vec(),
            bitwidth,
            values,
            transposed,
        });
        self
    }

    pub fn node(self, name: &str, op: &str, inputs: &[&str]) -> Self {
        self.node_with(name, op, inputs, None, None)
    }

    pub fn node_with(
        mut self,
        name: &str,
        op: &str,
        inputs: &[&str],
        kernel_size: Option<u8>,
        stride: Option<u8>,
    ) -> Self {
        self.spec.nodes.push(NodeSpec {
            name: name.to_string(),
            op: op.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            kernel_size,
            stride,
        });
        self
    }

    pub fn sample(mut self, values: Vec<f64>, label: u8) -> Self {
        self.spec.samples.push(values);
        self.spec.labels.push(label);
        self
    }

    /// Sample without a label; only valid when no sample has one.
    pub fn unlabelled_sample(mut self, values: Vec<f64>) -> Self {
        self.spec.samples.push(values);
        self
    }

    pub fn build(self) -> ModelSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_quantize_widths() {
        assert_eq!(quantize(&[0.5, -1.0, 2.0], 16).unwrap(), vec![16384, -32768, 32767]);
        assert_eq!(quantize(&[0.25], 32).unwrap(), vec![1 << 28]);
        assert_eq!(quantize(&[-1.0, 36.0], 64).unwrap(), vec![-1, 36]);
        assert!(quantize(&[1.0], 8).is_err());
    }

    #[test]
    fn test_samples_stay_in_legal_range() {
        assert_eq!(quantize_sample(1.0), LEGAL_MAX);
        assert_eq!(quantize_sample(5.0), LEGAL_MAX);
        assert_eq!(quantize_sample(-5.0), -LEGAL_MAX);
        assert_eq!(quantize_sample(0.0), 0);
    }

    #[test]
    fn test_demo_shape() {
        let demo = ModelSpec::demo();
        assert_eq!(demo.nodes.len(), 6);
        assert_eq!(demo.samples.len(), 4);
        assert_eq!(demo.labels, vec![0, 1, 2, 3]);
        assert!(demo.samples.iter().all(|s| s.len() == 64));
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("model.json");
        let demo = ModelSpec::demo();
        std::fs::write(&path, demo.to_json().unwrap()).unwrap();
        assert_eq!(ModelSpec::load(&path).unwrap(), demo);
    }

    #[test]
    fn test_defaults_when_fields_missing() {
        let json = r#"{
            "name": "tiny",
            "input": [1, 2],
            "parameters": [{"name": "w", "dims": [2, 2], "values": [0.5, 0, 0, 0.5]}],
            "nodes": [{"name": "fc", "op": "MatMul", "inputs": ["input", "w"]}]
        }"#;
        let spec = ModelSpec::from_json(json).unwrap();
        assert_eq!(spec.parameters[0].bitwidth, 16);
        assert!(!spec.parameters[0].transposed);
        assert!(spec.samples.is_empty());
        assert_eq!(spec.nodes[0].kernel_size, None);
    }
}
