//! Crash/resume integration tests: interrupted runs must produce exactly the
//! residue an uninterrupted run produces, regardless of where they stopped
//! or how they were wounded.

use rug::ops::Pow;
use rug::Integer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deepsquare::checkpoint::StateFile;
use deepsquare::fast::FastExp;
use deepsquare::gerbicz::GerbiczCheckMultipointExp;
use deepsquare::gw::GwState;
use deepsquare::input::InputNum;
use deepsquare::multipoint::MultipointExp;
use deepsquare::task::ExpError;

fn context(input: &InputNum) -> GwState {
    let mut gw = GwState::new();
    input.setup(&mut gw).expect("valid modulus");
    gw
}

fn iterated_power(x0: u32, b: u32, e: u64, modulus: &Integer) -> Integer {
    let exp = Integer::from(b).pow(u32::try_from(e).unwrap());
    Integer::from(x0).pow_mod(&exp, modulus).unwrap()
}

#[test]
fn multipoint_interrupted_at_point_equals_uninterrupted() {
    let input = InputNum::new(3, 2, 30, 1);
    let modulus = input.value();
    let points = vec![10u64, 25, 40];

    // Uninterrupted run.
    let expected = {
        let dir = tempfile::tempdir().unwrap();
        let mut gw = context(&input);
        let mut task = MultipointExp::new(
            input.clone(),
            2,
            points.clone(),
            Integer::from(3u32),
            StateFile::new(dir.path().join("mp.json")),
            Arc::new(AtomicBool::new(false)),
        );
        task.run(&mut gw).unwrap();
        task.state().unwrap().x.clone()
    };
    assert_eq!(expected, iterated_power(3, 2, 40, &modulus));

    // Interrupted at point 25, then resumed by a brand-new task.
    let dir = tempfile::tempdir().unwrap();
    let file = StateFile::new(dir.path().join("mp.json"));
    let abort = Arc::new(AtomicBool::new(false));
    let mut gw = context(&input);
    let mut task = MultipointExp::new(
        input.clone(),
        2,
        points.clone(),
        Integer::from(3u32),
        file.clone(),
        Arc::clone(&abort),
    );
    let stop = Arc::clone(&abort);
    task.set_on_point(Box::new(move |i, _| {
        if i == 25 {
            stop.store(true, Ordering::Relaxed);
        }
    }));
    assert!(matches!(task.run(&mut gw), Err(ExpError::Aborted)));
    assert_eq!(file.read_state().unwrap().iteration, 25);

    let mut resumed = MultipointExp::new(
        input,
        2,
        points,
        Integer::from(3u32),
        file,
        Arc::new(AtomicBool::new(false)),
    );
    resumed.run(&mut gw).unwrap();
    assert_eq!(resumed.state().unwrap().x, expected);
}

#[test]
fn split_prp_equals_full_exponent() {
    // 5*2^500+1: the PRP exponent N-1 = 5*2^500 computed two ways — the
    // full binary ladder, and a k-th power followed by checked squarings.
    let input = InputNum::new(5, 2, 500, 1);
    let modulus = input.value();

    let full = {
        let dir = tempfile::tempdir().unwrap();
        let mut gw = context(&input);
        let exp = modulus.clone() - 1u32;
        let mut task = FastExp::new(
            input.clone(),
            exp,
            3,
            StateFile::new(dir.path().join("fast.json")),
            Arc::new(AtomicBool::new(false)),
        );
        task.run(&mut gw).unwrap();
        task.state().unwrap().x.clone()
    };

    let split = {
        let dir = tempfile::tempdir().unwrap();
        let mut gw = context(&input);
        let start = Integer::from(3u32)
            .pow_mod(&Integer::from(5u32), &modulus)
            .unwrap();
        let mut task = GerbiczCheckMultipointExp::new(
            input.clone(),
            2,
            vec![125, 250, 375, 500],
            start,
            StateFile::new(dir.path().join("work.json")),
            StateFile::new(dir.path().join("recovery.json")),
            Arc::new(AtomicBool::new(false)),
        );
        task.run(&mut gw).unwrap();
        task.state().unwrap().x.clone()
    };

    assert_eq!(full, split);
}

#[test]
fn gerbicz_interrupted_then_wounded_resume_still_converges() {
    let input = InputNum::new(1, 2, 127, -1); // M127
    let modulus = input.value();
    let points = vec![300u64, 1000];
    let work = |dir: &tempfile::TempDir| StateFile::new(dir.path().join("work.json"));
    let rec = |dir: &tempfile::TempDir| StateFile::new(dir.path().join("recovery.json"));

    let dir = tempfile::tempdir().unwrap();
    let abort = Arc::new(AtomicBool::new(false));
    let mut gw = context(&input);
    let mut task = GerbiczCheckMultipointExp::new(
        input.clone(),
        2,
        points.clone(),
        Integer::from(3u32),
        work(&dir),
        rec(&dir),
        Arc::clone(&abort),
    );
    let stop = Arc::clone(&abort);
    task.set_on_point(Box::new(move |_, _| {
        stop.store(true, Ordering::Relaxed);
    }));
    assert!(matches!(task.run(&mut gw), Err(ExpError::Aborted)));

    // Resume in a fresh context with a silent fault armed: the Gerbicz
    // check must absorb it and the final residue must still be exact.
    let mut gw = context(&input);
    gw.inject_bitflip_after(100, 7);
    let mut resumed = GerbiczCheckMultipointExp::new(
        input,
        2,
        points,
        Integer::from(3u32),
        work(&dir),
        rec(&dir),
        Arc::new(AtomicBool::new(false)),
    );
    resumed.run(&mut gw).unwrap();
    assert_eq!(resumed.state().unwrap().x, iterated_power(3, 2, 1000, &modulus));
}

#[test]
fn rerunning_a_completed_task_is_a_no_op() {
    let input = InputNum::new(1, 2, 10, -15);
    let modulus = input.value();
    let dir = tempfile::tempdir().unwrap();
    let work = StateFile::new(dir.path().join("work.json"));
    let rec = StateFile::new(dir.path().join("recovery.json"));

    let mut gw = context(&input);
    let mut task = GerbiczCheckMultipointExp::new(
        input.clone(),
        2,
        vec![1000],
        Integer::from(3u32),
        work.clone(),
        rec.clone(),
        Arc::new(AtomicBool::new(false)),
    );
    task.run(&mut gw).unwrap();
    let first = task.state().unwrap().x.clone();
    let muls_after_first = gw.fft_count() / 2;

    // Same files, new task: everything is already proven, so the run
    // completes without a single multiplication.
    let mut again = GerbiczCheckMultipointExp::new(
        input,
        2,
        vec![1000],
        Integer::from(3u32),
        work,
        rec,
        Arc::new(AtomicBool::new(false)),
    );
    again.run(&mut gw).unwrap();
    assert_eq!(again.state().unwrap().x, first);
    assert_eq!(gw.fft_count() / 2, muls_after_first);
    assert_eq!(first, iterated_power(3, 2, 1000, &modulus));
}
