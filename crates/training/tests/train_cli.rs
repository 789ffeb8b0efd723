mod common;

use anyhow::Result;
use clap::Parser;
use training::util::checkpoint_path;
use training::{read_metrics, run_eval, run_train, EvalArgs, TrainArgs};

#[test]
fn two_workers_train_checkpoint_and_evaluate() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (train, val) = common::synthetic_split(tmp.path(), 3, 2)?;
    let ckpt_dir = tmp.path().join("ckpt");
    let metrics = tmp.path().join("metrics.jsonl");

    let args = TrainArgs::load_from([
        "train".to_string(),
        "--train-dir".into(),
        train.display().to_string(),
        "--test-dir".into(),
        val.display().to_string(),
        "--arch".into(),
        "resnet18".into(),
        "--epochs".into(),
        "1".into(),
        "--batch-size".into(),
        "2".into(),
        "--test-batch-size".into(),
        "4".into(),
        "--train-crop-size".into(),
        "32".into(),
        "--val-resize-size".into(),
        "36".into(),
        "--val-crop-size".into(),
        "32".into(),
        "--world-size".into(),
        "2".into(),
        "--seed".into(),
        "3".into(),
        "--lr".into(),
        "0.01".into(),
        "--checkpoint-dir".into(),
        ckpt_dir.display().to_string(),
        "--metrics-out".into(),
        metrics.display().to_string(),
    ])?;
    run_train(args)?;

    let ckpt = checkpoint_path(&ckpt_dir, 1);
    assert!(ckpt.exists());
    assert!(ckpt_dir.join("train_config.json").exists());

    // Rank 0 alone logs: five samples per rank at batch size two is three steps, then the
    // test summary.
    let rows = read_metrics(&metrics, None)?;
    assert_eq!(rows.len(), 4);
    assert!(rows[..3].iter().all(|r| r.metrics.contains_key("train/loss")));
    assert!(rows[3].metrics.contains_key("test/acc1"));

    let eval = EvalArgs::parse_from([
        "eval".to_string(),
        "--data-dir".into(),
        val.display().to_string(),
        "--checkpoint".into(),
        ckpt.display().to_string(),
        "--arch".into(),
        "resnet18".into(),
        "--val-resize-size".into(),
        "36".into(),
        "--val-crop-size".into(),
        "32".into(),
        "--metrics-out".into(),
        tmp.path().join("eval.jsonl").display().to_string(),
    ]);
    run_eval(eval)?;
    let eval_rows = read_metrics(&tmp.path().join("eval.jsonl"), None)?;
    assert_eq!(eval_rows.len(), 1);
    assert_eq!(eval_rows[0].metrics["test/epoch"], 1.0);
    Ok(())
}

#[test]
fn external_rank_with_many_workers_is_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (train, val) = common::synthetic_split(tmp.path(), 1, 1)?;
    let args = TrainArgs::load_from([
        "train".to_string(),
        "--train-dir".into(),
        train.display().to_string(),
        "--test-dir".into(),
        val.display().to_string(),
        "--world-size".into(),
        "2".into(),
        "--rank".into(),
        "1".into(),
        "--checkpoint-dir".into(),
        tmp.path().join("ckpt").display().to_string(),
    ])?;
    let err = run_train(args).unwrap_err();
    assert!(err.to_string().contains("rank 1"));
    Ok(())
}

#[test]
fn missing_train_folder_fails_cleanly() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (_, val) = common::synthetic_split(tmp.path(), 1, 1)?;
    let args = TrainArgs::load_from([
        "train".to_string(),
        "--train-dir".into(),
        tmp.path().join("nope").display().to_string(),
        "--test-dir".into(),
        val.display().to_string(),
        "--arch".into(),
        "resnet18".into(),
        "--world-size".into(),
        "2".into(),
        "--checkpoint-dir".into(),
        tmp.path().join("ckpt").display().to_string(),
    ])?;
    assert!(run_train(args).is_err());
    Ok(())
}
