//! Save, reload and keep training through the public API.

use graphtrain::config::{FitConfig, SavingFormat, TrainingContext, WritingMode};
use graphtrain::data::Dataset;
use graphtrain::layers::{Activation, Concatenate, Dense, Input, Layer};
use graphtrain::losses::{Loss, LossKind};
use graphtrain::metrics::MetricKind;
use graphtrain::network::{Network, Phase};
use graphtrain::optimizers::{Momentum, Optimizer};
use ndarray::Array;

fn data() -> Dataset {
    let features = Array::from_shape_fn((8, 3), |(i, j)| ((i * 3 + j) % 7) as f32 / 7.0 - 0.5).into_dyn();
    let labels = Array::from_shape_fn((8, 2), |(i, j)| ((i + j) % 3) as f32 / 3.0).into_dyn();
    Dataset::new(features, labels).unwrap()
}

/// input -> frozen dense -> concat(input) -> dense
fn functional(name: &str) -> Network {
    let mut network = Network::functional(name);
    let input = network.add(Layer::new(Input::new(&[3])), &[]).unwrap();
    let hidden = network
        .add(Layer::new(Dense::new(4).with_activation(Activation::Relu)).named("frozen").frozen(), &[input])
        .unwrap();
    let joined = network.add(Layer::new(Concatenate::default()), &[hidden, input]).unwrap();
    network
        .add(Layer::new(Dense::new(2).with_activation(Activation::Linear)), &[joined])
        .unwrap();
    network
}

fn compile(network: &mut Network) {
    network
        .compile(
            Loss::new(LossKind::Mse),
            Optimizer::new(Momentum::new(0.05, 0.9, false)).unwrap(),
            &[MetricKind::Mae],
            &TrainingContext::silent(),
        )
        .unwrap();
}

fn variable_names(network: &Network, optimizer: bool) -> Vec<String> {
    let specs = if optimizer { network.state().optimizer_variables() } else { network.state().all_variables() };
    specs.iter().map(|v| v.name.clone()).collect()
}

#[test]
fn test_reloaded_network_continues_identically() {
    let ctx = TrainingContext::silent();
    let dataset = data();
    for format in [
        SavingFormat::GraphCustomVariables,
        SavingFormat::JsonConfigCustomVariables,
        SavingFormat::JsonConfigSafeTensors,
    ] {
        let dir = tempfile::tempdir().unwrap();
        let mut original = functional("original");
        compile(&mut original);
        original.fit(&dataset, None, &FitConfig::new(3, 4), &mut [], &ctx).unwrap();
        original.save(dir.path(), format, WritingMode::FailIfExists, true, &TrainingContext::silent()).unwrap();

        let mut restored = functional("restored");
        compile(&mut restored);
        assert_eq!(restored.phase(), Phase::Compiled);
        restored.load_weights(dir.path(), true, &TrainingContext::silent()).unwrap();
        assert_eq!(restored.phase(), Phase::Initialized);
        for name in variable_names(&original, false).iter().chain(&variable_names(&original, true)) {
            assert_eq!(original.variable_value(name).unwrap(), restored.variable_value(name).unwrap(), "{}", name);
        }

        // momentum slots of the frozen layer do not exist
        assert!(!variable_names(&restored, true).iter().any(|n| n.contains("frozen")));

        let resume = FitConfig::new(2, 4).with_init_weights(false).with_init_optimizer(false);
        let a = original.fit(&dataset, None, &resume, &mut [], &ctx).unwrap();
        let b = restored.fit(&dataset, None, &resume, &mut [], &ctx).unwrap();
        for (x, y) in a.epoch_events().iter().zip(b.epoch_events()) {
            assert!((x.loss - y.loss).abs() < 1e-6, "{:?} vs {:?}", x, y);
        }
    }
}

#[test]
fn test_frozen_layer_is_untouched_by_training() {
    let ctx = TrainingContext::silent();
    let mut network = functional("frozen_check");
    compile(&mut network);
    network.init().unwrap();
    let kernel = network.variable_value("frozen_dense_kernel").unwrap();
    let config = FitConfig::new(3, 4).with_init_weights(false);
    network.fit(&data(), None, &config, &mut [], &ctx).unwrap();
    assert_eq!(network.variable_value("frozen_dense_kernel").unwrap(), kernel);
}

#[test]
fn test_copy_from_loaded_configuration() {
    let ctx = TrainingContext::silent();
    let dir = tempfile::tempdir().unwrap();
    let mut original = functional("arch");
    compile(&mut original);
    original.init().unwrap();
    original
        .save(dir.path(), SavingFormat::JsonConfigSafeTensors, WritingMode::Override, false, &TrainingContext::silent())
        .unwrap();

    let mut loaded = Network::load_model_configuration(dir.path()).unwrap();
    compile(&mut loaded);
    loaded.load_weights(dir.path(), false, &TrainingContext::silent()).unwrap();
    assert_eq!(loaded.inbound(2), vec![1, 0]);

    let mut inference = loaded.copy("inference", false, true, &ctx).unwrap();
    let sample = data().features().index_axis(ndarray::Axis(0), 0).to_owned();
    let expected = original.predict_softly(&sample).unwrap();
    let actual = inference.predict_softly(&sample).unwrap();
    assert_eq!(expected, actual);
}
