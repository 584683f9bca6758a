use bnlstm_text::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rcmaes::Vectorizable;
use tracing::info;

const DEFAULT_CONFIG: &str = r#"{
    "sequence_length": 12,
    "num_classes": 4,
    "vocab_size": 500,
    "hidden_size": 16,
    "embedding_size": 24,
    "l2_reg_lambda": 0.001
}"#;

pub fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let json = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEFAULT_CONFIG.to_string(),
    };
    let config = TextRNNConfig::from_json_str(&json)?;

    let mut store = ParameterStore::seeded(1234);
    let model = TextRNN::new(config.clone(), None, &mut store)?;
    let (flat, _) = store.to_vec();
    info!(trainable = flat.len(), variables = store.len(), "model ready");

    let mut rng = StdRng::seed_from_u64(99);
    let batch = 8;
    let input_x: Vec<Vec<usize>> = (0..batch)
        .map(|_| {
            (0..config.sequence_length)
                .map(|_| rng.random_range(0..config.vocab_size))
                .collect()
        })
        .collect();
    let mut input_y = Matrix::zeros(batch, config.num_classes);
    for r in 0..batch {
        for c in 0..config.num_classes {
            if rng.random::<f64>() < 0.3 {
                input_y.set(r, c, 1.0);
            }
        }
    }

    let keep_probs = [1.0, 0.9, 0.7, 0.5];
    let results: Vec<(f64, Result<TextRNNOutput>)> = keep_probs
        .par_iter()
        .map(|&keep| {
            let mut local = store.clone();
            (keep, model.forward(&mut local, &input_x, &input_y, keep))
        })
        .collect();
    for (keep, result) in results {
        let output = result?;
        let positives: usize = output
            .predictions(0.5)
            .iter()
            .map(|row| row.iter().filter(|p| **p).count())
            .sum();
        info!(keep_prob = keep, loss = output.loss, positives, "evaluated batch");
    }

    let mut cell_store = ParameterStore::seeded(7);
    let cell = BatchNormLSTMCell::new(6).is_training(true);
    let params = cell.build(&mut cell_store.root_scope(), Some(3))?;
    let sequence: Vec<Matrix> = (0..10)
        .map(|t| Matrix::filled(4, 3, (t as f64 * 0.3).sin()))
        .collect();
    let (outputs, _) = static_rnn(&cell, &mut cell_store, &params, &sequence, cell.zero_state(4))?;
    let pop_mean = cell_store.value(params.bn_c().pop_mean())?;
    info!(
        last = ?outputs.last().map(|m| m.row(0).to_vec()),
        pop_mean = ?pop_mean,
        "bn-lstm training pass"
    );

    let inference = cell.clone().is_training(false);
    let (outputs, _) = static_rnn(
        &inference,
        &mut cell_store,
        &params,
        &sequence,
        inference.zero_state(4),
    )?;
    info!(
        last = ?outputs.last().map(|m| m.row(0).to_vec()),
        "bn-lstm inference pass"
    );
    Ok(())
}
