pub mod config;
pub mod run;
pub mod state;

fn print_searched_locations() {
    eprintln!("Searched locations:");
    eprintln!("  ~/.config/loki-export/config.yml");
    eprintln!("  /etc/loki-export/config.yml");
}
