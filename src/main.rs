#![forbid(unsafe_code)]

use std::time::SystemTime;

use structopt::StructOpt;

use hubit::config::ModelConfig;
use hubit::component::NullLoader;
use hubit::errors::HubitError;
use hubit::model::Model;

mod cli;

use crate::cli::Opt;

fn main() {
    let opt = Opt::from_args();

    if opt.debug {
        println!("CLI returned these arguments : {:#?}", opt);
    }

    match run(&opt) {
        Ok(()) => (),
        Err(err) => {
            eprintln!("hubit : {}", err);
            std::process::exit(err.exit_code());
        }
    }
}

fn run(opt : &Opt) -> Result<(), HubitError> {
    let start_instant = SystemTime::now();

    let cfg = ModelConfig::from_file(&opt.model_file)?;
    let input = cli::read_input(&opt.input_file)?;

    // The binary has no component functions to register, so every
    // callable resolves to a stub and queries run as dryruns.
    let mut model = Model::new(cfg, &NullLoader)?;
    model.set_input(input)?;

    if opt.queries.is_empty() {
        println!(
            "Model OK : {} component(s), input accepted.",
            model.config().components().len()
        );
        return Ok(())
    }

    let queries : Vec<&str> = opt.queries.iter().map(String::as_str).collect();
    let plans = model.validate_query(&queries, opt.parallel)?;
    cli::print_plans(&queries, &plans);

    match start_instant.elapsed() {
        Ok(duration) => println!("\nValidated in {:?}.", duration),
        Err(_) => println!("\nValidated."),
    }
    Ok(())
}
