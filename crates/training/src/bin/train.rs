use training::util::init_tracing;
use training::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = TrainArgs::load()?;
    run_train(args)
}
