use std::path::{Path, PathBuf};
use std::time::Duration;

use console::Style;
use drp_core::data::Dataset;
use drp_core::pipeline::Instrument;
use drp_core::processor::registry;
use drp_core::report::ErrorStack;

struct Styles {
    title: Style,
    header: Style,
    label: Style,
    value: Style,
    method: Style,
    disabled: Style,
    path: Style,
    error: Style,
}

impl Styles {
    fn new() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            header: Style::new().cyan().bold(),
            label: Style::new().dim(),
            value: Style::new().bold().white(),
            method: Style::new().green(),
            disabled: Style::new().dim().yellow(),
            path: Style::new().underlined(),
            error: Style::new().red().bold(),
        }
    }
}

fn rule(len: usize) -> String {
    "\u{2550}".repeat(len)
}

pub struct RunSummary<'a> {
    pub night: &'a str,
    pub instrument: &'a str,
    pub configurations: &'a [String],
    pub dataset: &'a Dataset,
    pub errors: &'a ErrorStack,
    pub error_path: &'a Path,
    pub artifacts: &'a [PathBuf],
    pub elapsed: Duration,
}

pub fn print_run_summary(run: &RunSummary<'_>) {
    let s = Styles::new();

    println!();
    println!("  {}", s.title.apply_to("Reduction Summary"));
    println!("  {}", s.title.apply_to(rule(17)));
    println!();

    println!("  {:<14}{}", s.label.apply_to("Night"), s.value.apply_to(run.night));
    println!(
        "  {:<14}{}",
        s.label.apply_to("Instrument"),
        s.method.apply_to(run.instrument)
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Configs"),
        s.method.apply_to(run.configurations.join(", "))
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Elapsed"),
        s.value.apply_to(format!("{:.1}s", run.elapsed.as_secs_f64()))
    );
    println!();

    println!("  {}", s.header.apply_to("Output"));
    println!(
        "    {:<12}{}",
        s.label.apply_to("Batches"),
        s.value.apply_to(run.dataset.len())
    );
    println!(
        "    {:<12}{}",
        s.label.apply_to("Blocks"),
        s.value.apply_to(run.dataset.block_count())
    );
    for artifact in run.artifacts {
        println!(
            "    {:<12}{}",
            s.label.apply_to("Artifact"),
            s.path.apply_to(artifact.display())
        );
    }
    println!();

    if run.errors.is_empty() {
        println!(
            "  {:<14}{}",
            s.header.apply_to("Errors"),
            s.disabled.apply_to("none")
        );
    } else {
        println!("  {}", s.header.apply_to("Errors"));
        println!(
            "    {:<12}{}",
            s.label.apply_to("Total"),
            s.error.apply_to(run.errors.len())
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Noncritical"),
            s.value.apply_to(run.errors.noncritical_count())
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Images"),
            s.value.apply_to(run.errors.failed_images().len())
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Log"),
            s.path.apply_to(run.error_path.display())
        );
    }
    println!();
}

pub fn print_processors(instrument: Option<&dyn Instrument>) {
    let s = Styles::new();

    println!();
    println!("  {}", s.title.apply_to("Processors"));
    println!("  {}", s.title.apply_to(rule(10)));
    println!();
    for info in registry::builtin().values() {
        println!(
            "  {:<18}{:<20}{}",
            s.method.apply_to(info.key),
            s.label.apply_to(info.kind),
            info.summary
        );
    }
    println!();

    if let Some(instrument) = instrument {
        println!(
            "  {} {}",
            s.header.apply_to("Configurations of"),
            s.value.apply_to(instrument.name())
        );
        for (name, list) in instrument.configurations() {
            println!(
                "    {:<14}{}",
                s.method.apply_to(name),
                s.label.apply_to(list.keys().join(" -> "))
            );
        }
        println!();
    }
}
