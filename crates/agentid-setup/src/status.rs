use colored::Colorize;

pub fn info(message: &str) {
    println!("{} {message}", "[info]".cyan());
}

pub fn success(message: &str) {
    println!("{} {message}", "[ok]".green());
}

pub fn warn(message: &str) {
    println!("{} {message}", "[warn]".yellow());
}

pub fn error(message: &str) {
    eprintln!("{} {message}", "[err]".red());
}

/// Prints the run's accumulated warnings as one block after the main output,
/// where they are hardest to miss.
pub fn warnings_section(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!();
    println!("{}", format!("{} warning(s):", warnings.len()).yellow().bold());
    for warning in warnings {
        warn(warning);
    }
}
