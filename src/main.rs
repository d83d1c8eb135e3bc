use lantern::console::TerminalConsole;
use lantern::files::StdFileService;
use lantern::interpreter::{Interpreter, Options, Outcome};
use lantern::machine::Machine;
use lantern::memory::MemoryImage;
use log::{debug, info};
use std::env;
use std::process;

fn main() {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!("lantern - story-file interpreter");
        println!();
        println!("Usage: {} <story_file> [--rows N] [--seed N]", args[0]);
        println!();
        println!("  --rows N   screen rows before a [MORE] pause (0 disables)");
        println!("  --seed N   start the game RNG in its deterministic mode");
        return;
    }

    let story_path = &args[1];
    let mut options = Options::default();
    let mut seed = None;
    let mut n = 2;
    while n + 1 < args.len() {
        match args[n].as_str() {
            "--rows" => match args[n + 1].parse() {
                Ok(rows) => options.rows = rows,
                Err(_) => {
                    eprintln!("Invalid row count: {}", args[n + 1]);
                    process::exit(2);
                }
            },
            "--seed" => match args[n + 1].parse() {
                Ok(value) => seed = Some(value),
                Err(_) => {
                    eprintln!("Invalid seed: {}", args[n + 1]);
                    process::exit(2);
                }
            },
            other => {
                eprintln!("Unknown option: {}", other);
                process::exit(2);
            }
        }
        n += 2;
    }
    // Derive companion file names from the story path
    options.save_name = format!("{}.sav", story_path);

    debug!("loading story {}", story_path);
    let mut files = StdFileService::new();
    let image = match MemoryImage::load(&mut files, story_path) {
        Ok(image) => image,
        Err(fault) => {
            eprintln!("Error: cannot load story '{}': {}", story_path, fault);
            eprintln!();
            eprintln!("Please check:");
            eprintln!("- the path names a story file");
            eprintln!("- the file is complete and readable");
            process::exit(1);
        }
    };
    info!("{}", image.header());

    let machine = Machine::new(image);
    let mut interpreter = Interpreter::with_options(
        machine,
        Box::new(TerminalConsole),
        Box::new(files),
        options,
    );
    if let Some(seed) = seed {
        interpreter.rng_mut().randomize(seed);
    }

    match interpreter.run() {
        Ok(Outcome::Quit) => {
            println!();
        }
        Err(fault) => {
            eprintln!();
            eprintln!("The story stopped: {}", fault);
            process::exit(1);
        }
    }
}
