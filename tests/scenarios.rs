use bnlstm_text::initializers::{BnLstmIdentity, Initializer, Orthogonal};
use bnlstm_text::linalg::orthonormality_error;
use bnlstm_text::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rcmaes::Vectorizable;

fn token_batch(batch: usize, seq: usize, vocab: usize) -> Vec<Vec<usize>> {
    (0..batch)
        .map(|b| (0..seq).map(|t| (b * 13 + t * 29 + 1) % vocab).collect())
        .collect()
}

#[test]
fn bn_lstm_cell_single_step() {
    let mut store = ParameterStore::seeded(11);
    let cell = BatchNormLSTMCell::new(4).is_training(true);
    let params = cell.build(&mut store.root_scope(), Some(3)).unwrap();
    let x = Matrix::from_rows(&[vec![0.1, -0.4, 0.9], vec![1.5, 0.2, -0.3]]).unwrap();

    let (out, state) = cell
        .call(&mut store, &params, &x, &cell.zero_state(2))
        .unwrap();
    assert_eq!(out.shape(), [2, 4]);
    assert_eq!(state.c.shape(), [2, 4]);
    assert_eq!(state.h.shape(), [2, 4]);
    assert!(out.is_finite() && state.c.is_finite());
}

#[test]
fn initializers_have_expected_structure() {
    let mut rng = StdRng::seed_from_u64(5);
    let tall = Orthogonal.initialize(&[7, 3], &mut rng).unwrap();
    let tall = Matrix::from_vec(7, 3, tall).unwrap();
    assert!(orthonormality_error(&tall, false) < 1e-9);

    let n = 3;
    let w = BnLstmIdentity { scale: 0.95 }
        .initialize(&[n, 4 * n], &mut rng)
        .unwrap();
    let w = Matrix::from_vec(n, 4 * n, w).unwrap();
    for r in 0..n {
        for c in 0..n {
            let expected = if r == c { 0.95 } else { 0.0 };
            assert_eq!(w.get(r, n + c), expected);
        }
    }
    for &block in [0, 2, 3].iter() {
        let b = w.block(0, block * n, n, n);
        assert!(orthonormality_error(&b, false) < 1e-9);
    }
}

#[test]
fn text_rnn_end_to_end() {
    let config = TextRNNConfig::new(5, 3, 100, 6, 8).l2_reg_lambda(0.01);
    let mut store = ParameterStore::seeded(2024);
    let model = TextRNN::new(config, None, &mut store).unwrap();

    let input_x = token_batch(4, 5, 100);
    let input_y = Matrix::from_rows(&[
        vec![1.0, 0.0, 1.0],
        vec![0.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![1.0, 1.0, 1.0],
    ])
    .unwrap();

    let output = model.forward(&mut store, &input_x, &input_y, 0.8).unwrap();
    assert_eq!(output.logits.shape(), [4, 3]);
    assert!(output.logits.is_finite());
    assert!(output.loss.is_finite());
    assert!(output.loss >= 0.0);
    assert!(output
        .scores
        .data()
        .iter()
        .all(|p| *p > 0.0 && *p < 1.0));
}

#[test]
fn building_twice_in_one_store_conflicts() {
    let config = TextRNNConfig::new(5, 3, 100, 6, 8);
    let mut store = ParameterStore::seeded(0);
    TextRNN::new(config.clone(), None, &mut store).unwrap();
    assert!(matches!(
        TextRNN::new(config, None, &mut store),
        Err(ModelError::VariableExists { .. })
    ));
}

#[test]
fn frozen_embedding_is_left_out_of_parameter_vector() {
    let config = TextRNNConfig::new(4, 2, 10, 3, 5);
    let table = Matrix::filled(10, 5, 0.5);

    let mut frozen = ParameterStore::seeded(1);
    TextRNN::new(config.clone(), Some(&table), &mut frozen).unwrap();
    let mut trainable = ParameterStore::seeded(1);
    TextRNN::new(config.embedding_type(1), Some(&table), &mut trainable).unwrap();

    let (frozen_vec, _) = frozen.to_vec();
    let (trainable_vec, _) = trainable.to_vec();
    assert_eq!(trainable_vec.len(), frozen_vec.len() + 50);
}

#[test]
fn parameter_vector_round_trip_changes_predictions() {
    let config = TextRNNConfig::new(4, 2, 10, 3, 5);
    let mut store = ParameterStore::seeded(9);
    let model = TextRNN::new(config, None, &mut store).unwrap();
    let input_x = token_batch(2, 4, 10);
    let before = model.logits(&mut store, &input_x, 1.0).unwrap();

    let (mut flat, ctx) = store.to_vec();
    for v in flat.iter_mut() {
        *v *= 0.5;
    }
    let mut halved = ParameterStore::from_vec(&flat, &ctx);
    let after = model.logits(&mut halved, &input_x, 1.0).unwrap();
    assert_eq!(after.shape(), before.shape());
    assert_ne!(after, before);
}
