use super::{input_space_or_unit, ForwardModel, ModelConfig, ModelError};
use crate::config::ConfigErrors;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticFunction {
    /// `d_j = sum_i x_i^(j+1)`
    Polynomial,
    /// `d_j = sum_i sin((j+1) * x_i + i)`
    Trigonometric,
}

#[derive(Debug, Clone)]
pub struct AnalyticModel {
    function: AnalyticFunction,
    output_size: usize,
    input_space: Vec<(f64, f64)>,
}

impl AnalyticModel {
    pub fn new(function: AnalyticFunction, input_size: usize, output_size: usize) -> Self {
        Self {
            function,
            output_size,
            input_space: input_space_or_unit(&[], input_size),
        }
    }

    pub fn load(config: &ModelConfig) -> Result<Self, ConfigErrors> {
        match config {
            ModelConfig::Analytic {
                function,
                input_size,
                output_size,
                input_space,
            } => Ok(Self {
                function: *function,
                output_size: *output_size,
                input_space: input_space_or_unit(input_space, *input_size),
            }),
            other => {
                error!("Analytic model cannot be loaded from {other:?}");

                Err(ConfigErrors::FailedLoadModel)
            }
        }
    }
}

impl ForwardModel for AnalyticModel {
    fn input_size(&self) -> usize {
        self.input_space.len()
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn input_space(&self, dim: usize) -> (f64, f64) {
        self.input_space.get(dim).copied().unwrap_or((0.0, 1.0))
    }

    fn run(&self, input: &[f64]) -> Result<Vec<f64>, ModelError> {
        if input.len() != self.input_size() {
            return Err(ModelError::InputSize {
                expected: self.input_size(),
                actual: input.len(),
            });
        }

        let output = (0..self.output_size)
            .map(|j| match self.function {
                AnalyticFunction::Polynomial => {
                    input.iter().map(|x| x.powi(j as i32 + 1)).sum::<f64>()
                }
                AnalyticFunction::Trigonometric => input
                    .iter()
                    .enumerate()
                    .map(|(i, x)| ((j + 1) as f64 * x + i as f64).sin())
                    .sum::<f64>(),
            })
            .collect();

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomial_outputs() {
        let model = AnalyticModel::new(AnalyticFunction::Polynomial, 2, 3);
        let output = model.run(&[0.5, 2.0]).unwrap();

        assert_eq!(output, vec![2.5, 4.25, 8.125]);
    }

    #[test]
    fn wrong_input_size() {
        let model = AnalyticModel::new(AnalyticFunction::Trigonometric, 2, 1);

        assert!(matches!(
            model.run(&[0.5]),
            Err(ModelError::InputSize {
                expected: 2,
                actual: 1
            })
        ));
    }
}
