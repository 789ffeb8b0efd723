use clap::Parser;
use training::util::init_tracing;
use training::{run_eval, EvalArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = EvalArgs::parse();
    run_eval(args)
}
