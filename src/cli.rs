use std::fs::read_to_string;
use std::path::PathBuf;

use structopt::StructOpt;

use hubit::errors::HubitError;
use hubit::runner::WorkerPlan;
use hubit::value::Value;

#[derive(StructOpt, Debug)]
#[structopt(name = "hubit",
            about = "Declarative, path-addressed calculation engine. \
                     Validates a model against an input and dry-runs queries \
                     without invoking any component function.",
            version = "0.1.0")]
pub struct Opt {
    #[structopt(short = "d", long = "debug")]
    pub debug : bool,

    /** Resolve the query graph with the parallel dispatcher instead of
        the cooperative one. The dryrun itself is cheap either way; this
        exercises the executor pool and the watcher.
        */
    #[structopt(short = "p", long = "parallel")]
    pub parallel : bool,

    /** Query paths to resolve against the model, e.g. 'cars[:].price'.
        May be given multiple times. Without queries only the model
        itself is validated.
        */
    #[structopt(short = "q", long = "query")]
    pub queries : Vec<String>,

    /** The model file : a YAML sequence of component entries.
        */
    #[structopt(name = "MODEL", parse(from_os_str))]
    pub model_file : PathBuf,

    /** The input file : arbitrary nested YAML.
        */
    #[structopt(name = "INPUT", parse(from_os_str))]
    pub input_file : PathBuf,
}

pub fn read_input(path : &PathBuf) -> Result<Value, HubitError> {
    let source = read_to_string(path)
        .map_err(|e| HubitError::Config(format!("cannot read '{}' : {}", path.display(), e)))?;
    serde_yaml::from_str(&source)
        .map_err(|e| HubitError::Config(format!("cannot parse '{}' : {}", path.display(), e)))
}

pub fn print_plans(queries : &[&str], plans : &[WorkerPlan]) {
    println!("Query");
    for query in queries {
        println!("  {}", query);
    }
    println!("Workers ({})", plans.len());
    for plan in plans {
        println!("  {} <- {}", plan.component_id, plan.query_path);
        for provided in &plan.provides {
            println!("    writes {}", provided);
        }
        for awaited in &plan.awaited {
            println!("    awaits {}", awaited);
        }
    }
}
