use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use covgen_rs::bdd::FeatureBdd;
use covgen_rs::cfa::Cfa;
use covgen_rs::driver::TestGenerator;
use covgen_rs::explorer::ExplorerFactory;
use covgen_rs::goal::CoverageCriterion;
use covgen_rs::options::Options;

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Coverage criterion (`edges` or `decisions`).
    #[arg(value_name = "CRITERION", default_value = "edges")]
    criterion: CoverageCriterion,

    /// Properties file with generation options.
    #[clap(long, value_name = "FILE")]
    properties: Option<PathBuf>,

    /// Guard the `then` branch with feature `LOGGING` and track presence conditions.
    #[clap(long)]
    variability: bool,

    /// Time limit per analysis run (in seconds).
    #[clap(long, value_name = "INT")]
    time_limit: Option<u64>,

    /// Number of goals per analysis run (0 means all at once).
    #[clap(long, value_name = "INT", default_value = "1")]
    goals_per_run: usize,

    /// Directory for the test-suite listing and generation times.
    #[clap(long, value_name = "DIR")]
    output: Option<PathBuf>,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let args = Cli::parse();
    println!("args = {:?}", args);

    let mut options = match &args.properties {
        Some(path) => Options::from_properties(&std::fs::read_to_string(path)?)?,
        None => Options::default(),
    };
    options.criterion = args.criterion;
    options.goals_per_run = args.goals_per_run;
    options.with_presence_conditions = args.variability;
    if let Some(secs) = args.time_limit {
        options.time_limit = Some(Duration::from_secs(secs));
    }
    if let Some(dir) = &args.output {
        options.testsuite_file = dir.join("testsuite.txt");
        options.generation_times_file = dir.join("generationTimes.csv");
    }

    // int main() {
    //     int x = __VERIFIER_nondet();
    //     if (x > 0) { log(x); y = 1; } else { y = 2; }
    //     return y;
    // }
    let bdd = args.variability.then(|| Arc::new(FeatureBdd::new()));
    let mut cfa = Cfa::new();
    let n0 = cfa.add_function("main");
    let n1 = cfa.add_node("main");
    let n2 = cfa.add_node("main");
    let n3 = cfa.add_node("main");
    let n4 = cfa.add_node("main");
    let n5 = cfa.add_node("main");
    let n6 = cfa.add_node("main");
    cfa.add_input(n0, n1, "x", 42);
    cfa.add_assume(n1, n2, "x > 0", true);
    cfa.add_assume(n1, n3, "x > 0", false);
    let log = cfa.add_edge(n2, n4, "log(x);");
    let skip = cfa.add_edge(n2, n4, "skip;");
    cfa.add_edge(n4, n5, "y = 1;");
    cfa.add_edge(n3, n5, "y = 2;");
    cfa.add_edge(n5, n6, "return y;");
    if let Some(bdd) = &bdd {
        let logging = bdd.declare("LOGGING");
        cfa.set_presence(log, logging);
        cfa.set_presence(skip, bdd.not(logging));
    }
    let cfa = Arc::new(cfa);
    println!("cfa: {} nodes, {} edges", cfa.num_nodes(), cfa.num_edges());

    let time_total = std::time::Instant::now();
    let factory = ExplorerFactory::new(cfa.clone(), bdd.clone());
    let mut generator = TestGenerator::for_criterion(options, cfa, bdd, factory)?;
    let report = generator.generate()?;
    println!("{}", report);
    println!("{}", generator.testsuite());

    if args.output.is_some() {
        generator.write_outputs()?;
        println!("Outputs written to {:?}", generator.options().testsuite_file.parent());
    }

    println!("Total time: {:?}", time_total.elapsed());
    Ok(())
}
