use super::{
    fs::{ChannelError, Checkpoint, SharedState},
    partition::SeqRange,
    reduce::GlobalBest,
};

#[test]
pub fn records_survive_bit_for_bit() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 2).unwrap();
    let range = SeqRange::inclusive(3, 5);
    let data = vec![0.1, -0.0, f64::MIN_POSITIVE, 1e300, f64::NAN, -7.25];
    let posterior = vec![0.3, 1.0 / 3.0, 0.0];

    shared.write_records(range, &data, &posterior).unwrap();

    let read_data = shared.read_data(range).unwrap();
    let read_posterior = shared.read_posterior(range).unwrap();

    let bits = |values: &[f64]| values.iter().map(|value| value.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&read_data), bits(&data));
    assert_eq!(bits(&read_posterior), bits(&posterior));
}

#[test]
pub fn records_live_at_fixed_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 3).unwrap();

    // written out of order by "different ranks"
    shared
        .write_records(SeqRange::new(2, 1), &[7.0, 8.0, 9.0], &[0.5])
        .unwrap();
    shared
        .write_records(SeqRange::new(0, 2), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[0.1, 0.2])
        .unwrap();

    assert_eq!(
        std::fs::metadata(shared.data_path()).unwrap().len(),
        3 * 3 * 8
    );
    assert_eq!(shared.read_data(SeqRange::new(1, 2)).unwrap(), vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    assert_eq!(shared.read_posterior(SeqRange::new(0, 3)).unwrap(), vec![0.1, 0.2, 0.5]);
}

#[test]
pub fn empty_range_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 2).unwrap();
    let empty = SeqRange::inclusive(4, 3);

    shared.write_records(empty, &[], &[]).unwrap();

    assert!(shared.read_data(empty).unwrap().is_empty());
    assert!(shared.read_posterior(empty).unwrap().is_empty());
    assert_eq!(std::fs::metadata(shared.data_path()).unwrap().len(), 0);
}

#[test]
pub fn length_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 2).unwrap();

    assert!(matches!(
        shared.write_records(SeqRange::new(0, 2), &[1.0, 2.0, 3.0], &[0.1, 0.2]),
        Err(ChannelError::LengthMismatch {
            expected: 4,
            actual: 3,
            ..
        })
    ));
}

#[test]
pub fn short_read_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 1).unwrap();

    shared.write_records(SeqRange::new(0, 1), &[1.0], &[0.5]).unwrap();

    assert!(matches!(
        shared.read_posterior(SeqRange::new(0, 2)),
        Err(ChannelError::Io { .. })
    ));
}

#[test]
pub fn create_truncates_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 1).unwrap();
    shared.write_records(SeqRange::new(0, 2), &[1.0, 2.0], &[0.1, 0.2]).unwrap();
    shared.write_checkpoint(&checkpoint()).unwrap();

    let shared = SharedState::create(dir.path(), 1).unwrap();

    assert_eq!(std::fs::metadata(shared.posterior_path()).unwrap().len(), 0);
    assert!(!shared.checkpoint_path().exists());
}

fn checkpoint() -> Checkpoint {
    Checkpoint {
        round: 2,
        pass: SeqRange::inclusive(17, 29),
        generation: 3,
        best: GlobalBest {
            value: 0.75,
            index: 11,
        },
        topology: "bounds: []\npoints: []\n".to_string(),
    }
}

#[test]
pub fn checkpoint_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 1).unwrap();

    shared.write_checkpoint(&checkpoint()).unwrap();
    assert_eq!(shared.read_checkpoint().unwrap(), checkpoint());

    // rewritten wholesale
    let mut next = checkpoint();
    next.round = 3;
    shared.write_checkpoint(&next).unwrap();

    let attached = SharedState::open(dir.path(), 1);
    assert_eq!(attached.read_checkpoint().unwrap(), next);
    assert!(!shared.checkpoint_path().with_extension("bin.tmp").exists());
}

#[test]
pub fn removed_checkpoint_cannot_be_read() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 1).unwrap();
    shared.write_checkpoint(&checkpoint()).unwrap();

    shared.remove_checkpoint().unwrap();
    assert!(!shared.checkpoint_path().exists());
    assert!(matches!(
        shared.read_checkpoint(),
        Err(ChannelError::Io { .. })
    ));

    // already gone
    shared.remove_checkpoint().unwrap();
}

#[test]
pub fn truncated_checkpoint_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedState::create(dir.path(), 1).unwrap();
    shared.write_checkpoint(&checkpoint()).unwrap();

    let bytes = std::fs::read(shared.checkpoint_path()).unwrap();
    std::fs::write(shared.checkpoint_path(), &bytes[..bytes.len() - 4]).unwrap();

    assert!(matches!(
        shared.read_checkpoint(),
        Err(ChannelError::MalformedCheckpoint { .. })
    ));
}
