use console::{Emoji, style};

pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

/// Boxed-free, indentation-based section printer used by the CLI commands.
pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines.push(format!(
            "  {} {}: {}",
            GEAR,
            style(label).bold().cyan(),
            value
        ));
        self
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines.push(format!(
            "  {:<12} {}",
            style(name).green().bold(),
            style(description).dim()
        ));
        self
    }

    pub fn info(mut self, msg: &str) -> Self {
        self.lines.push(format!("  {} {}", INFO_ICON, msg));
        self
    }

    pub fn warn(mut self, msg: &str) -> Self {
        self.lines
            .push(format!("  {} {}", WARN_ICON, style(msg).yellow()));
        self
    }

    pub fn text(mut self, msg: &str) -> Self {
        self.lines.push(format!("  {}", msg));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn print(self) {
        println!("\n{}", style(self.title).bold().underlined());
        for line in self.lines {
            println!("{}", line);
        }
    }
}

pub fn print_banner() {
    println!();
    println!("{}", style("drydock").cyan().bold());
    println!(
        "{}",
        style("Schedule, sandbox, and supervise agent tasks.").dim()
    );
}
