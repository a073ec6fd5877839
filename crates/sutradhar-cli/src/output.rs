use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

fn color() -> bool {
    std::io::Stdout::is_terminal(&std::io::stdout())
}

pub fn heading(text: &str) {
    if color() {
        println!("{}", text.bold());
    } else {
        println!("{}", text);
    }
}

pub fn success(text: &str) {
    if color() {
        println!("{} {}", "✓".green(), text);
    } else {
        println!("ok: {}", text);
    }
}

pub fn warning(text: &str) {
    if color() {
        println!("{} {}", "!".yellow(), text);
    } else {
        println!("warn: {}", text);
    }
}

pub fn error(text: &str) {
    if std::io::Stderr::is_terminal(&std::io::stderr()) {
        eprintln!("{} {}", "✗".red(), text);
    } else {
        eprintln!("error: {}", text);
    }
}

pub fn detail(text: &str) {
    if color() {
        println!("  {}", text.dimmed());
    } else {
        println!("  {}", text);
    }
}
