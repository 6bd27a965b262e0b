use super::Network;
use crate::error::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSummary {
    pub name: String,
    pub type_name: String,
    pub output_shape: String,
    pub params: usize,
    pub inbound: Vec<String>,
}

/// Per-layer output shapes and parameter counts of a built network.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub name: String,
    pub layers: Vec<LayerSummary>,
    pub trainable_params: usize,
    pub frozen_params: usize,
}

impl ModelSummary {
    pub fn total_params(&self) -> usize {
        self.trainable_params + self.frozen_params
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(90);
        writeln!(f, "Model: {}", self.name)?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "{:<30}{:<22}{:>12}  {}", "Layer (type)", "Output shape", "Params", "Connected to")?;
        writeln!(f, "{}", rule)?;
        for layer in &self.layers {
            writeln!(
                f,
                "{:<30}{:<22}{:>12}  {}",
                format!("{} ({})", layer.name, layer.type_name),
                layer.output_shape,
                layer.params,
                layer.inbound.join(", ")
            )?;
        }
        writeln!(f, "{}", rule)?;
        writeln!(f, "Total params: {}", self.total_params())?;
        writeln!(f, "Trainable params: {}", self.trainable_params)?;
        write!(f, "Non-trainable params: {}", self.frozen_params)
    }
}

impl Network {
    pub fn summary(&self) -> Result<ModelSummary> {
        if self.layers.iter().any(|l| !l.is_built()) {
            return Err(Error::lifecycle(format!("network '{}' must be built before its summary", self.name)));
        }
        let layers = self
            .layers
            .iter()
            .enumerate()
            .map(|(id, layer)| LayerSummary {
                name: layer.name.clone(),
                type_name: layer.type_name().to_string(),
                output_shape: layer.output_shape().map(|s| s.to_string()).unwrap_or_default(),
                params: layer.param_count(),
                inbound: self.inbound(id).into_iter().map(|from| self.layers[from].name.clone()).collect(),
            })
            .collect();
        let count = |trainable: bool| {
            self.state
                .all_variables()
                .iter()
                .filter(|v| v.trainable == trainable)
                .map(|v| v.num_elements())
                .sum::<usize>()
        };
        Ok(ModelSummary {
            name: self.name.clone(),
            layers,
            trainable_params: count(true),
            frozen_params: count(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::mlp;
    use super::*;
    use crate::config::TrainingContext;
    use crate::layers::{Dense, Input, Layer};

    #[test]
    fn test_summary_counts_parameters() {
        let mut network = mlp("summary");
        assert!(network.summary().is_err());
        network.build(&TrainingContext::silent()).unwrap();

        let summary = network.summary().unwrap();
        let params: Vec<usize> = summary.layers.iter().map(|l| l.params).collect();
        assert_eq!(params, vec![0, 4 * 8 + 8, 8 * 3 + 3]);
        assert_eq!(summary.trainable_params, 67);
        assert_eq!(summary.frozen_params, 0);
        assert_eq!(summary.layers[2].inbound, vec!["dense_2"]);

        let table = summary.to_string();
        assert!(table.contains("dense_3 (Dense)"));
        assert!(table.ends_with("Non-trainable params: 0"));
    }

    #[test]
    fn test_frozen_layers_are_counted_apart() {
        let mut network = Network::sequential(
            "frozen",
            vec![
                Layer::new(Input::new(&[2])),
                Layer::new(Dense::new(2)).frozen(),
                Layer::new(Dense::new(1)),
            ],
        )
        .unwrap();
        network.build(&TrainingContext::silent()).unwrap();
        let summary = network.summary().unwrap();
        assert_eq!(summary.frozen_params, 6);
        assert_eq!(summary.trainable_params, 3);
        assert_eq!(summary.total_params(), 9);
    }
}
