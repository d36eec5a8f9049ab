//! Closed sets of identifiers used to describe a network
//!
//! Every identifier parses from the same names used in config files
//! (`"BiLSTM"`, `"adam"`, `"huber"`, ...). Unknown names are a
//! [`ForecastError::Configuration`].

use crate::error::ForecastError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recurrent architecture of the stacked network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelKind {
    Lstm,
    BiLstm,
    Gru,
    BiGru,
}

impl ModelKind {
    pub fn cell(&self) -> CellKind {
        match self {
            ModelKind::Lstm | ModelKind::BiLstm => CellKind::Lstm,
            ModelKind::Gru | ModelKind::BiGru => CellKind::Gru,
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        matches!(self, ModelKind::BiLstm | ModelKind::BiGru)
    }
}

impl FromStr for ModelKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lstm" => Ok(ModelKind::Lstm),
            "bilstm" => Ok(ModelKind::BiLstm),
            "gru" => Ok(ModelKind::Gru),
            "bigru" => Ok(ModelKind::BiGru),
            _ => Err(ForecastError::config(format!("unknown model type '{}'", s))),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::Lstm => "LSTM",
            ModelKind::BiLstm => "BiLSTM",
            ModelKind::Gru => "GRU",
            ModelKind::BiGru => "BiGRU",
        };
        f.write_str(name)
    }
}

/// Recurrent cell type inside a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellKind {
    Lstm,
    Gru,
}

/// Output head of the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Head {
    /// One linear unit predicting the scaled close
    Regression,
    /// One sigmoid unit predicting P(up)
    Classification,
}

impl FromStr for Head {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "regression" => Ok(Head::Regression),
            "classification" => Ok(Head::Classification),
            _ => Err(ForecastError::config(format!("unknown model head '{}'", s))),
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Head::Regression => f.write_str("regression"),
            Head::Classification => f.write_str("classification"),
        }
    }
}

/// Dense layer activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Linear,
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// Derivative expressed through the activation output `y`
    pub fn derivative_from_output(&self, y: f64) -> f64 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Tanh => 1.0 - y * y,
            Activation::Sigmoid => y * (1.0 - y),
        }
    }
}

impl FromStr for Activation {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            _ => Err(ForecastError::config(format!("unknown activation '{}'", s))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
        };
        f.write_str(name)
    }
}

/// Optimizer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    Adam,
    RmsProp,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "sgd" => Ok(OptimizerKind::Sgd),
            _ => Err(ForecastError::config(format!("unknown optimizer '{}'", s))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::RmsProp => "rmsprop",
            OptimizerKind::Sgd => "sgd",
        };
        f.write_str(name)
    }
}

/// Training loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossKind {
    Mse,
    Mae,
    /// Huber loss with delta 1.0
    Huber,
    BinaryCrossEntropy,
}

impl FromStr for LossKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mse" | "mean_squared_error" => Ok(LossKind::Mse),
            "mae" | "mean_absolute_error" => Ok(LossKind::Mae),
            "huber" => Ok(LossKind::Huber),
            "binary_crossentropy" | "bce" => Ok(LossKind::BinaryCrossEntropy),
            _ => Err(ForecastError::config(format!("unknown loss '{}'", s))),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LossKind::Mse => "mse",
            LossKind::Mae => "mae",
            LossKind::Huber => "huber",
            LossKind::BinaryCrossEntropy => "binary_crossentropy",
        };
        f.write_str(name)
    }
}

/// Metric tracked during training and evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricKind {
    Mae,
    Mse,
    Rmse,
    Mape,
    Accuracy,
}

impl MetricKind {
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Mae => "mae",
            MetricKind::Mse => "mse",
            MetricKind::Rmse => "rmse",
            MetricKind::Mape => "mape",
            MetricKind::Accuracy => "accuracy",
        }
    }

    /// Whether larger values are better
    pub fn higher_is_better(&self) -> bool {
        matches!(self, MetricKind::Accuracy)
    }
}

impl FromStr for MetricKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mae" => Ok(MetricKind::Mae),
            "mse" => Ok(MetricKind::Mse),
            "rmse" => Ok(MetricKind::Rmse),
            "mape" => Ok(MetricKind::Mape),
            "accuracy" | "acc" => Ok(MetricKind::Accuracy),
            _ => Err(ForecastError::config(format!("unknown metric '{}'", s))),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

macro_rules! string_conversions {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = ForecastError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }

            impl From<$ty> for String {
                fn from(value: $ty) -> Self {
                    value.to_string()
                }
            }
        )*
    };
}

string_conversions!(ModelKind, Head, Activation, OptimizerKind, LossKind, MetricKind);

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_parsing() {
        assert_eq!("BiLSTM".parse::<ModelKind>().unwrap(), ModelKind::BiLstm);
        assert_eq!("gru".parse::<ModelKind>().unwrap(), ModelKind::Gru);
        assert!(ModelKind::BiGru.is_bidirectional());
        assert_eq!(ModelKind::BiGru.cell(), CellKind::Gru);
    }

    #[test]
    fn test_unknown_identifiers_are_configuration_errors() {
        assert!(matches!(
            "transformer".parse::<ModelKind>(),
            Err(ForecastError::Configuration(_))
        ));
        assert!(matches!(
            "adagrad".parse::<OptimizerKind>(),
            Err(ForecastError::Configuration(_))
        ));
        assert!(matches!(
            "hinge".parse::<LossKind>(),
            Err(ForecastError::Configuration(_))
        ));
        assert!(matches!(
            "f1".parse::<MetricKind>(),
            Err(ForecastError::Configuration(_))
        ));
    }

    #[test]
    fn test_display_round_trip() {
        for kind in [ModelKind::Lstm, ModelKind::BiLstm, ModelKind::Gru, ModelKind::BiGru] {
            assert_eq!(kind.to_string().parse::<ModelKind>().unwrap(), kind);
        }
        for loss in [
            LossKind::Mse,
            LossKind::Mae,
            LossKind::Huber,
            LossKind::BinaryCrossEntropy,
        ] {
            assert_eq!(loss.to_string().parse::<LossKind>().unwrap(), loss);
        }
    }

    #[test]
    fn test_activation_derivatives() {
        let y = Activation::Sigmoid.apply(0.0);
        assert_eq!(y, 0.5);
        assert_eq!(Activation::Sigmoid.derivative_from_output(y), 0.25);
        assert_eq!(Activation::Relu.derivative_from_output(0.0), 0.0);
        assert_eq!(Activation::Tanh.derivative_from_output(0.0), 1.0);
    }
}
