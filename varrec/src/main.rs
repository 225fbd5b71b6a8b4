use varrec::*;

use std::path::PathBuf;

use clap::Parser;

/// Recover stack and register variables of lifted functions
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Recover variables of a function from a textual listing of its lifted blocks
    FromListing {
        /// Path to the listing (see the `text_lifter` module for its format)
        listing: PathBuf,
        /// Path to output file for the summary of recovered variables
        #[clap(long)]
        output: Option<PathBuf>,
        /// Maximum number of times a single block is processed
        #[clap(long, default_value_t = 1)]
        max_iterations: usize,
        /// Stop at the first statement that cannot be evaluated, instead of continuing with an
        /// unbound result
        #[clap(long)]
        fail_fast: bool,
        /// Periodically yield to other threads while analyzing
        #[clap(long)]
        low_priority: bool,
        /// Do not adjust the stack pointer after calls
        #[clap(long)]
        no_track_sp: bool,
        /// Output the function graph, annotated with live variables, as a GraphViz `.dot` file to
        /// the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the recovery heuristics
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<recovery_config::CommandLineRecoveryConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromListing {
            listing,
            output,
            max_iterations,
            fail_fast,
            low_priority,
            no_track_sp,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let logger = match crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ) {
                Ok(logger) => logger,
                Err(e) => {
                    eprintln!("Could not set up logging: {}", e);
                    std::process::exit(2);
                }
            };
            let _log_guard = slog_scope::set_global_logger(logger);

            recovery_config::RecoveryConfig::initialize(advanced_config);

            if let Err(e) = run(
                listing,
                output,
                recovery::RecoveryOptions {
                    max_iterations,
                    low_priority,
                    track_sp: !no_track_sp,
                    fail_fast,
                },
                debug_output_graphviz,
            ) {
                log::crit!("Recovery failed"; "error" => %e);
                eprintln!("error: {}", e);
                std::process::exit(1);
            }

            log::trace!("Done");
        }
    }
}

fn run(
    listing: PathBuf,
    output: Option<PathBuf>,
    options: recovery::RecoveryOptions,
    debug_output_graphviz: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listing = text_lifter::lift_from(&std::fs::read_to_string(listing)?)?;
    let recovered = recovery::VariableRecoveryFast::analyze(
        &listing.arch,
        &listing.graph,
        &listing.blocks,
        options,
    )?;

    if let Some(path) = debug_output_graphviz {
        std::fs::write(path, recovered.generate_dot())?;
    }

    match output {
        Some(path) => std::fs::write(path, recovered.summary())?,
        None => println!("{}", recovered.summary()),
    }
    Ok(())
}
