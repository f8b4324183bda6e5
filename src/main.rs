//! Evolve Search CLI - Run a program search from JSON configuration.

use std::fs;
use std::path::PathBuf;
use std::process;

use evolve_search::{
    evolution::{
        CommandBackend, EvaluationPipeline, ProgramArchive, PromptBuilder, RetryingGenerator,
        ScoringEntryPoint, SearchController, SearchError, SeedProgram, TemplateVersioner,
        UsageMeter,
    },
    schema::{BackendCommand, ScoringCommand, SearchConfig},
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json>", args[0]);
        eprintln!();
        eprintln!("Run an evolutionary program search from JSON configuration.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to search configuration file");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let config = SearchConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Error loading config {}: {}", config_path.display(), e);
        process::exit(1);
    });

    if let Err(e) = run(config).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(config: SearchConfig) -> Result<(), SearchError> {
    let results_dir = config.results_dir.clone();
    fs::create_dir_all(&results_dir)?;
    let config_json = serde_json::to_string_pretty(&config).map_err(std::io::Error::other)?;
    fs::write(results_dir.join("config.json"), config_json)?;

    let entry = ScoringEntryPoint::from_config(&config.evaluation)?;
    let backend = CommandBackend::from_config(&config.generator)?;

    let archive = ProgramArchive::open(&results_dir, &config.archive)?;
    let pipeline = EvaluationPipeline::new(&config.evaluation, entry)?;
    let usage = UsageMeter::new();
    let generator =
        RetryingGenerator::new(backend, &config.generator)?.with_usage_meter(usage.clone());
    let prompts = PromptBuilder::from_config(&config.prompt);

    let mut search = SearchController::new(
        config.controller.clone(),
        archive,
        pipeline,
        prompts,
        Box::new(generator),
        usage,
    );
    if config.prompt.evolve_templates {
        search = search.with_meta_evolver(Box::new(TemplateVersioner::new(&config.prompt.meta)));
    }

    println!("Evolve Search");
    println!("=============");
    println!("Results: {}", results_dir.display());
    println!(
        "Archive: capacity {}, retention {}, metrics [{}]",
        config.archive.capacity,
        config.archive.retention,
        config.archive.metrics.join(", ")
    );
    println!("Max iterations: {}", config.controller.max_iterations);
    println!();

    if search.archive().is_empty() {
        let seeds = config
            .initial_programs
            .iter()
            .map(SeedProgram::from_file)
            .collect::<Result<Vec<_>, _>>()?;
        println!("Seeding {} initial programs...", seeds.len());
        search.seed(seeds).await?;
    } else {
        println!("Resuming with {} programs", search.archive().len());
    }

    let stop = search.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, stopping after the current iteration");
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    let outcome = search
        .run_with_callback(|progress| {
            println!(
                "  Iteration {}/{}: best={:.6}, population={}, failed={}, calls={}",
                progress.iteration,
                progress.max_iterations,
                progress.best_score,
                progress.population,
                progress.failed_iterations,
                progress.usage.calls
            );
        })
        .await?;
    search.pipeline().shutdown();

    println!();
    println!("Stopped: {:?}", outcome.state);
    println!(
        "Iterations: {} ({} failed), evaluations: {}, time: {:.1}s",
        outcome.stats.iterations,
        outcome.stats.failed_iterations,
        outcome.stats.evaluations,
        outcome.stats.elapsed_seconds
    );
    println!(
        "Generator calls: {}, success rate: {:.1}%",
        outcome.stats.usage.calls,
        outcome.stats.usage.success_rate * 100.0
    );

    let extension = config.archive.source_extension.trim_start_matches('.');
    for (i, record) in outcome.best.iter().enumerate() {
        let path = results_dir.join(format!("best_program_{}.{}", i + 1, extension));
        fs::write(&path, &record.code)?;
        println!("  #{} {} ({}) -> {}", i + 1, record.id, record.scores, path.display());
    }

    let summary = serde_json::to_string_pretty(&outcome).map_err(std::io::Error::other)?;
    fs::write(results_dir.join("summary.json"), summary)?;

    Ok(())
}

fn print_example_config() {
    let mut config = SearchConfig::default();
    config.initial_programs = vec![PathBuf::from("initial_program.py")];
    config.evaluation.scoring_command = Some(ScoringCommand {
        program: "python3".to_string(),
        args: vec!["evaluate.py".to_string()],
    });
    config.generator.command = Some(BackendCommand {
        program: "llm".to_string(),
        args: vec!["-m".to_string(), "{model}".to_string()],
    });

    println!("Example configuration (config.json):");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing example config: {}", e),
    }
}
