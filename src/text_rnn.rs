/*
 * Bidirectional LSTM text classifier.
 *
 *   token ids [batch, T]
 *     -> embedding lookup            [batch, T, E]
 *     -> forward / backward LSTM     2 x [batch, T, H]   (output dropout)
 *     -> concat per step             [batch, T, 2H]
 *     -> mean over time              [batch, 2H]
 *     -> x W + b                     [batch, C]  logits
 *     -> sigmoid cross entropy, summed over classes, averaged over batch,
 *        plus l2_reg_lambda * (|W|^2 / 2 + |b|^2 / 2)
 *
 * Multi-label: every class is an independent binary decision.
 */

use crate::activation::sigmoid;
use crate::error::{ModelError, Result};
use crate::initializers::{Constant, FromValues, GlorotUniform, RandomUniform};
use crate::lstm::{BasicLSTMCell, BasicLSTMParams};
use crate::matrix::Matrix;
use crate::rnn::{bidirectional_rnn, DropoutWrapper, RNNCell};
use crate::variables::{ParameterStore, Reuse, VarId};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TextRNNConfig {
    pub sequence_length: usize,
    pub num_classes: usize,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub embedding_size: usize,
    /// Only consulted when a pretrained table is supplied: 0 keeps it
    /// frozen, 1 makes it trainable.
    #[serde(default)]
    pub embedding_type: u8,
    #[serde(default)]
    pub l2_reg_lambda: f64,
}

impl TextRNNConfig {
    pub fn new(
        sequence_length: usize,
        num_classes: usize,
        vocab_size: usize,
        hidden_size: usize,
        embedding_size: usize,
    ) -> Self {
        TextRNNConfig {
            sequence_length,
            num_classes,
            vocab_size,
            hidden_size,
            embedding_size,
            embedding_type: 0,
            l2_reg_lambda: 0.0,
        }
    }

    pub fn embedding_type(self, embedding_type: u8) -> Self {
        Self {
            embedding_type,
            ..self
        }
    }

    pub fn l2_reg_lambda(self, l2_reg_lambda: f64) -> Self {
        Self {
            l2_reg_lambda,
            ..self
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TextRNNConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("sequence_length", self.sequence_length),
            ("num_classes", self.num_classes),
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("embedding_size", self.embedding_size),
        ];
        for (name, value) in sizes.iter() {
            if *value == 0 {
                return Err(ModelError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if !(self.l2_reg_lambda >= 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "l2_reg_lambda must be non-negative, got {}",
                self.l2_reg_lambda
            )));
        }
        Ok(())
    }
}

/// Where the embedding table comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingMode {
    /// Uniform in [-1, 1), trainable.
    RandomUniform,
    /// Pretrained, held constant.
    FrozenPretrained,
    /// Pretrained starting point, trainable.
    TrainablePretrained,
}

impl EmbeddingMode {
    pub fn resolve(has_pretrained: bool, embedding_type: u8) -> Result<Self> {
        match (has_pretrained, embedding_type) {
            (false, _) => Ok(EmbeddingMode::RandomUniform),
            (true, 0) => Ok(EmbeddingMode::FrozenPretrained),
            (true, 1) => Ok(EmbeddingMode::TrainablePretrained),
            (true, other) => Err(ModelError::InvalidConfig(format!(
                "embedding_type must be 0 (frozen) or 1 (trainable), got {}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TextRNNOutput {
    /// `[batch, num_classes]`
    pub logits: Matrix,
    /// Per-class probabilities, `sigmoid(logits)`.
    pub scores: Matrix,
    pub loss: f64,
}

impl TextRNNOutput {
    pub fn predictions(&self, threshold: f64) -> Vec<Vec<bool>> {
        (0..self.scores.rows())
            .map(|r| self.scores.row(r).iter().map(|p| *p > threshold).collect())
            .collect()
    }
}

/// Elementwise `max(x, 0) - x * z + ln(1 + e^-|x|)`.
pub fn sigmoid_cross_entropy_with_logits(labels: &Matrix, logits: &Matrix) -> Result<Matrix> {
    if labels.shape() != logits.shape() {
        return Err(ModelError::shape(
            "labels vs logits",
            &logits.shape(),
            &labels.shape(),
        ));
    }
    let mut out = logits.clone();
    for (v, z) in out.data_mut().iter_mut().zip(labels.data().iter()) {
        let x = *v;
        *v = x.max(0.0) - x * z + (-x.abs()).exp().ln_1p();
    }
    Ok(out)
}

#[derive(Clone, Debug)]
pub struct TextRNN {
    config: TextRNNConfig,
    embedding_mode: EmbeddingMode,
    embedding: VarId,
    fw_cell: BasicLSTMCell,
    bw_cell: BasicLSTMCell,
    fw_params: BasicLSTMParams,
    bw_params: BasicLSTMParams,
    output_w: VarId,
    output_b: VarId,
}

impl TextRNN {
    /// Creates every variable of the model in `store`. Fails on bad sizes,
    /// a pretrained table of the wrong shape, or names already present in
    /// the store.
    pub fn new(
        config: TextRNNConfig,
        pretrained_embedding: Option<&Matrix>,
        store: &mut ParameterStore,
    ) -> Result<Self> {
        config.validate()?;
        let embedding_mode =
            EmbeddingMode::resolve(pretrained_embedding.is_some(), config.embedding_type)?;
        let table_shape = [config.vocab_size, config.embedding_size];

        let embedding = {
            let mut scope = store.scope("embedding", Reuse::Create);
            match pretrained_embedding {
                None => scope.get_variable(
                    "W",
                    &table_shape,
                    RandomUniform {
                        low: -1.0,
                        high: 1.0,
                    },
                    true,
                )?,
                Some(table) => {
                    if table.shape() != table_shape {
                        return Err(ModelError::EmbeddingShapeMismatch {
                            expected: table_shape.to_vec(),
                            actual: table.shape().to_vec(),
                        });
                    }
                    let trainable = embedding_mode == EmbeddingMode::TrainablePretrained;
                    scope.get_variable("W", &table_shape, FromValues(table.data()), trainable)?
                }
            }
        };

        let fw_cell = BasicLSTMCell::new(config.hidden_size);
        let bw_cell = BasicLSTMCell::new(config.hidden_size);
        let (fw_params, bw_params) = {
            let mut scope = store.scope("bidirectional_rnn", Reuse::Create);
            let fw_params = fw_cell.build(
                &mut scope.sub_scope("fw", Reuse::Inherit),
                Some(config.embedding_size),
            )?;
            let bw_params = bw_cell.build(
                &mut scope.sub_scope("bw", Reuse::Inherit),
                Some(config.embedding_size),
            )?;
            (fw_params, bw_params)
        };

        let (output_w, output_b) = {
            let mut scope = store.scope("output", Reuse::Create);
            let w = scope.get_variable(
                "W",
                &[config.hidden_size * 2, config.num_classes],
                GlorotUniform,
                true,
            )?;
            let b = scope.get_variable("b", &[config.num_classes], Constant(0.1), true)?;
            (w, b)
        };

        info!(
            vocab_size = config.vocab_size,
            embedding_size = config.embedding_size,
            hidden_size = config.hidden_size,
            num_classes = config.num_classes,
            embedding = ?embedding_mode,
            trainable_parameters = store.num_trainable_parameters(),
            "assembled TextRNN"
        );

        Ok(TextRNN {
            config,
            embedding_mode,
            embedding,
            fw_cell,
            bw_cell,
            fw_params,
            bw_params,
            output_w,
            output_b,
        })
    }

    pub fn config(&self) -> &TextRNNConfig {
        &self.config
    }

    pub fn embedding_mode(&self) -> EmbeddingMode {
        self.embedding_mode
    }

    pub fn embedding(&self) -> VarId {
        self.embedding
    }

    pub fn output_weights(&self) -> VarId {
        self.output_w
    }

    pub fn output_bias(&self) -> VarId {
        self.output_b
    }

    fn check_tokens(&self, input_x: &[Vec<usize>]) -> Result<()> {
        if input_x.is_empty() {
            return Err(ModelError::shape(
                "input_x batch",
                &[1, self.config.sequence_length],
                &[0, self.config.sequence_length],
            ));
        }
        for row in input_x.iter() {
            if row.len() != self.config.sequence_length {
                return Err(ModelError::shape(
                    "input_x sequence length",
                    &[self.config.sequence_length],
                    &[row.len()],
                ));
            }
            if let Some(&index) = row.iter().find(|&&i| i >= self.config.vocab_size) {
                return Err(ModelError::TokenOutOfRange {
                    index,
                    vocab_size: self.config.vocab_size,
                });
            }
        }
        Ok(())
    }

    /// Looks up `input_x` in the embedding table, one `[batch, E]` matrix
    /// per time step.
    pub fn embed(&self, store: &ParameterStore, input_x: &[Vec<usize>]) -> Result<Vec<Matrix>> {
        self.check_tokens(input_x)?;
        let table = store.value(self.embedding)?;
        let e = self.config.embedding_size;
        if table.len() != self.config.vocab_size * e {
            return Err(ModelError::shape(
                "embedding table",
                &[self.config.vocab_size, e],
                &[table.len()],
            ));
        }
        (0..self.config.sequence_length)
            .into_par_iter()
            .map(|t| {
                let mut data = Vec::with_capacity(input_x.len() * e);
                for row in input_x.iter() {
                    let token = row[t];
                    data.extend_from_slice(&table[token * e..(token + 1) * e]);
                }
                Matrix::from_vec(input_x.len(), e, data)
            })
            .collect()
    }

    /// Mean over time of the concatenated forward/backward outputs,
    /// `[batch, 2 * hidden_size]`.
    pub fn pooled_features(
        &self,
        store: &mut ParameterStore,
        input_x: &[Vec<usize>],
        dropout_keep_prob: f64,
    ) -> Result<Matrix> {
        let embedded = self.embed(store, input_x)?;
        let fw = DropoutWrapper::new(self.fw_cell.clone(), dropout_keep_prob)?;
        let bw = DropoutWrapper::new(self.bw_cell.clone(), dropout_keep_prob)?;
        let outputs = bidirectional_rnn(
            &fw,
            &self.fw_params,
            &bw,
            &self.bw_params,
            store,
            &embedded,
        )?;

        let steps = outputs.concatenated()?;
        let mut pooled = Matrix::zeros(input_x.len(), self.config.hidden_size * 2);
        for step in steps.iter() {
            pooled = pooled.add(step)?;
        }
        Ok(pooled.scale(1.0 / steps.len() as f64))
    }

    /// Unnormalized class scores, `[batch, num_classes]`.
    pub fn logits(
        &self,
        store: &mut ParameterStore,
        input_x: &[Vec<usize>],
        dropout_keep_prob: f64,
    ) -> Result<Matrix> {
        let pooled = self.pooled_features(store, input_x, dropout_keep_prob)?;
        pooled
            .matmul(&store.matrix(self.output_w)?)?
            .add_row_vector(store.value(self.output_b)?)
    }

    /// `(|W|^2 + |b|^2) / 2` over the output projection.
    pub fn l2_loss(&self, store: &ParameterStore) -> Result<f64> {
        let w: f64 = store.value(self.output_w)?.iter().map(|v| v * v).sum();
        let b: f64 = store.value(self.output_b)?.iter().map(|v| v * v).sum();
        Ok((w + b) / 2.0)
    }

    pub fn loss(&self, store: &ParameterStore, logits: &Matrix, input_y: &Matrix) -> Result<f64> {
        if logits.rows() == 0 {
            return Err(ModelError::shape(
                "loss batch",
                &[1, self.config.num_classes],
                &logits.shape(),
            ));
        }
        let losses = sigmoid_cross_entropy_with_logits(input_y, logits)?;
        let batch = losses.rows();
        let per_example: f64 = (0..batch).map(|r| losses.row(r).iter().sum::<f64>()).sum();
        let mean = per_example / batch as f64;
        Ok(mean + self.config.l2_reg_lambda * self.l2_loss(store)?)
    }

    pub fn forward(
        &self,
        store: &mut ParameterStore,
        input_x: &[Vec<usize>],
        input_y: &Matrix,
        dropout_keep_prob: f64,
    ) -> Result<TextRNNOutput> {
        let expected = [input_x.len(), self.config.num_classes];
        if input_y.shape() != expected {
            return Err(ModelError::shape("input_y", &expected, &input_y.shape()));
        }
        let logits = self.logits(store, input_x, dropout_keep_prob)?;
        let loss = self.loss(store, &logits, input_y)?;
        debug!(batch = input_x.len(), loss, "TextRNN forward");
        Ok(TextRNNOutput {
            scores: logits.map(sigmoid),
            logits,
            loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TextRNNConfig {
        TextRNNConfig::new(5, 3, 100, 6, 8)
    }

    fn tokens(batch: usize, seq: usize, vocab: usize) -> Vec<Vec<usize>> {
        (0..batch)
            .map(|b| (0..seq).map(|t| (b * 31 + t * 7) % vocab).collect())
            .collect()
    }

    #[test]
    fn cross_entropy_matches_naive_formula() {
        let logits = Matrix::from_rows(&[vec![0.5, -2.0, 3.0]]).unwrap();
        let labels = Matrix::from_rows(&[vec![1.0, 0.0, 0.0]]).unwrap();
        let ce = sigmoid_cross_entropy_with_logits(&labels, &logits).unwrap();
        for c in 0..3 {
            let x = logits.get(0, c);
            let z = labels.get(0, c);
            let p = sigmoid(x);
            let naive = -z * p.ln() - (1.0 - z) * (1.0 - p).ln();
            assert!((ce.get(0, c) - naive).abs() < 1e-12);
        }
        let big = Matrix::from_rows(&[vec![1000.0, -1000.0]]).unwrap();
        let ce = sigmoid_cross_entropy_with_logits(&Matrix::zeros(1, 2), &big).unwrap();
        assert!(ce.is_finite());
    }

    #[test]
    fn variables_are_laid_out_by_scope() {
        let mut store = ParameterStore::seeded(0);
        let model = TextRNN::new(config(), None, &mut store).unwrap();
        assert_eq!(model.embedding_mode(), EmbeddingMode::RandomUniform);
        for name in [
            "embedding/W",
            "bidirectional_rnn/fw/basic_lstm_cell/kernel",
            "bidirectional_rnn/bw/basic_lstm_cell/bias",
            "output/W",
            "output/b",
        ]
        .iter()
        {
            assert!(store.find(name).is_some(), "missing {}", name);
        }
        assert_eq!(store.variable(model.output_weights()).unwrap().shape(), &[12, 3]);
        assert!(store.value(model.output_bias()).unwrap().iter().all(|b| *b == 0.1));
        assert!(store
            .value(model.embedding())
            .unwrap()
            .iter()
            .all(|v| *v >= -1.0 && *v < 1.0));
    }

    #[test]
    fn frozen_and_trainable_pretrained_tables() {
        let table = Matrix::filled(100, 8, 0.25);

        let mut store = ParameterStore::seeded(0);
        let frozen = TextRNN::new(config(), Some(&table), &mut store).unwrap();
        assert_eq!(frozen.embedding_mode(), EmbeddingMode::FrozenPretrained);
        assert!(!store.variable(frozen.embedding()).unwrap().trainable());
        assert_eq!(store.value(frozen.embedding()).unwrap(), table.data());

        let mut store = ParameterStore::seeded(0);
        let trainable =
            TextRNN::new(config().embedding_type(1), Some(&table), &mut store).unwrap();
        assert_eq!(trainable.embedding_mode(), EmbeddingMode::TrainablePretrained);
        assert!(store.variable(trainable.embedding()).unwrap().trainable());

        let mut store = ParameterStore::seeded(0);
        assert!(matches!(
            TextRNN::new(config().embedding_type(2), Some(&table), &mut store),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn pretrained_shape_must_match() {
        let mut store = ParameterStore::seeded(0);
        let table = Matrix::zeros(99, 8);
        assert!(matches!(
            TextRNN::new(config(), Some(&table), &mut store),
            Err(ModelError::EmbeddingShapeMismatch { .. })
        ));
    }

    #[test]
    fn embedding_lookup_is_time_major() {
        let mut store = ParameterStore::seeded(0);
        let model = TextRNN::new(config(), None, &mut store).unwrap();
        let x = tokens(2, 5, 100);
        let steps = model.embed(&store, &x).unwrap();
        assert_eq!(steps.len(), 5);
        let table = store.value(model.embedding()).unwrap();
        let token = x[1][3];
        assert_eq!(steps[3].row(1), &table[token * 8..(token + 1) * 8]);
    }

    #[test]
    fn bad_inputs_are_rejected() {
        let mut store = ParameterStore::seeded(0);
        let model = TextRNN::new(config(), None, &mut store).unwrap();
        let y = Matrix::zeros(1, 3);
        assert!(matches!(
            model.forward(&mut store, &[vec![1, 2, 3]], &y, 1.0),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            model.forward(&mut store, &[vec![1, 2, 3, 4, 100]], &y, 1.0),
            Err(ModelError::TokenOutOfRange { index: 100, .. })
        ));
        assert!(matches!(
            model.forward(&mut store, &[vec![1, 2, 3, 4, 5]], &y, 0.0),
            Err(ModelError::InvalidConfig(_))
        ));
        assert!(matches!(
            model.forward(&mut store, &[vec![1, 2, 3, 4, 5]], &Matrix::zeros(2, 3), 1.0),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn l2_penalty_adds_to_loss() {
        let x = tokens(4, 5, 100);
        let y = Matrix::from_rows(&[
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 1.0],
            vec![0.0, 0.0, 0.0],
            vec![1.0, 1.0, 1.0],
        ])
        .unwrap();

        let mut store = ParameterStore::seeded(3);
        let plain = TextRNN::new(config(), None, &mut store).unwrap();
        let base = plain.forward(&mut store, &x, &y, 1.0).unwrap();

        let mut store = ParameterStore::seeded(3);
        let regularized = TextRNN::new(config().l2_reg_lambda(0.5), None, &mut store).unwrap();
        let penalized = regularized.forward(&mut store, &x, &y, 1.0).unwrap();

        let expected = base.loss + 0.5 * regularized.l2_loss(&store).unwrap();
        assert!((penalized.loss - expected).abs() < 1e-9);
        assert_eq!(base.logits, penalized.logits);
    }

    #[test]
    fn store_without_model_variables_is_an_error() {
        let mut store = ParameterStore::seeded(1);
        let model = TextRNN::new(config(), None, &mut store).unwrap();
        let mut empty = ParameterStore::seeded(1);
        assert!(matches!(
            model.logits(&mut empty, &[vec![1, 2, 3, 4, 5]], 1.0),
            Err(ModelError::UnknownVariable { .. })
        ));
        assert!(matches!(
            model.l2_loss(&empty),
            Err(ModelError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn loss_rejects_empty_batch() {
        let mut store = ParameterStore::seeded(1);
        let model = TextRNN::new(config(), None, &mut store).unwrap();
        let empty = Matrix::zeros(0, 3);
        assert!(matches!(
            model.loss(&store, &empty, &empty),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn full_keep_probability_is_deterministic() {
        let mut store = ParameterStore::seeded(8);
        let model = TextRNN::new(config(), None, &mut store).unwrap();
        let x = tokens(3, 5, 100);
        let a = model.logits(&mut store, &x, 1.0).unwrap();
        let b = model.logits(&mut store, &x, 1.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let json = r#"{
            "sequence_length": 5,
            "num_classes": 3,
            "vocab_size": 100,
            "hidden_size": 6,
            "embedding_size": 8
        }"#;
        let parsed = TextRNNConfig::from_json_str(json).unwrap();
        assert_eq!(parsed, config());

        let zero = r#"{"sequence_length": 0, "num_classes": 3, "vocab_size": 100,
                      "hidden_size": 6, "embedding_size": 8}"#;
        assert!(matches!(
            TextRNNConfig::from_json_str(zero),
            Err(ModelError::InvalidConfig(_))
        ));
        assert!(matches!(
            TextRNNConfig::from_json_str("{"),
            Err(ModelError::Json(_))
        ));
    }

    #[test]
    fn predictions_threshold_scores() {
        let logits = Matrix::from_rows(&[vec![2.0, -2.0]]).unwrap();
        let out = TextRNNOutput {
            scores: logits.map(sigmoid),
            logits,
            loss: 0.0,
        };
        assert_eq!(out.predictions(0.5), vec![vec![true, false]]);
    }
}
