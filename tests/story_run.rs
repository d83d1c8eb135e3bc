//! End-to-end runs over the public API: streamed loading, the fetch-execute
//! loop, console output and terminal outcomes.

use lantern::console::{Console, RecordingConsole};
use lantern::fault::Fault;
use lantern::files::{MemFileService, FileService, FileMode, FileHandle, SeekOrigin};
use lantern::interpreter::{Interpreter, Options, Outcome};
use lantern::machine::Machine;
use lantern::memory::MemoryImage;
use std::cell::RefCell;
use std::rc::Rc;

/// Minimal story image: header pointing at an empty dictionary and globals,
/// code starting at 0x800.
fn story(version: u8, code: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 0x1000];
    bytes[0] = version;
    let shift = match version {
        1..=4 => 0,
        5 | 7 | 8 => 1,
        _ => 2,
    };
    let hdr = |addr: u16| addr >> shift;
    let set = |bytes: &mut Vec<u8>, at: usize, w: u16| {
        bytes[at] = (w >> 8) as u8;
        bytes[at + 1] = w as u8;
    };
    set(&mut bytes, 0x06, hdr(0x800)); // initial PC
    set(&mut bytes, 0x08, hdr(0x700)); // dictionary
    set(&mut bytes, 0x0A, hdr(0x300)); // objects
    set(&mut bytes, 0x0C, hdr(0x100)); // globals
    set(&mut bytes, 0x0E, hdr(0x800)); // static boundary
    set(&mut bytes, 0x18, hdr(0x40)); // abbreviations
    bytes[0x700] = 0; // no separators
    bytes[0x701] = 7; // entry length
    bytes[0x800..0x800 + code.len()].copy_from_slice(code);
    bytes
}

struct SharedConsole(Rc<RefCell<RecordingConsole>>);

impl Console for SharedConsole {
    fn write_char(&mut self, c: char) {
        self.0.borrow_mut().write_char(c);
    }

    fn write_str(&mut self, s: &str) {
        self.0.borrow_mut().write_str(s);
    }

    fn read_line(&mut self) -> String {
        self.0.borrow_mut().read_line()
    }
}

fn run_story(bytes: Vec<u8>) -> (Result<Outcome, Fault>, String) {
    let mut files = MemFileService::new();
    files.insert("story.dat", bytes);
    let image = MemoryImage::load(&mut files, "story.dat").expect("story loads");
    let console = Rc::new(RefCell::new(RecordingConsole::new()));
    let mut interpreter = Interpreter::with_options(
        Machine::new(image),
        Box::new(SharedConsole(console.clone())),
        Box::new(files),
        Options {
            rows: 0,
            ..Options::default()
        },
    );
    let outcome = interpreter.run();
    let output = console.borrow().output.clone();
    (outcome, output)
}

#[test]
fn hello_then_quit_runs_clean() {
    // print "hello" ; quit -- "hello" packs to two Z-string words
    let code = [0xB2, 0x35, 0x51, 0xC6, 0x85, 0xBA];
    let (outcome, output) = run_story(story(3, &code));
    assert_eq!(outcome, Ok(Outcome::Quit));
    assert_eq!(output, "hello");
}

#[test]
fn division_by_zero_warns_and_stores_zero() {
    // div 10 0 -> g16 ; print_num g16 ; quit
    let code = [0x17, 0x0A, 0x00, 0x10, 0xE6, 0xBF, 0x10, 0xBA];
    let (outcome, output) = run_story(story(3, &code));
    assert_eq!(outcome, Ok(Outcome::Quit));
    assert_eq!(output, "0");
}

#[test]
fn print_num_is_signed() {
    // sub 0 5 -> g16 ; print_num g16 ; quit
    let code = [0x15, 0x00, 0x05, 0x10, 0xE6, 0xBF, 0x10, 0xBA];
    let (_, output) = run_story(story(3, &code));
    assert_eq!(output, "-5");
}

#[test]
fn deterministic_rng_counts_upward() {
    // random -3 (seed the cycle) ; random 100 x3 into g16..g18 ; quit
    let code = [
        0xE7, 0x3F, 0xFF, 0xFD, 0x10, // random -3 -> g16 (stores 0)
        0xE7, 0x7F, 0x64, 0x10, // random 100 -> g16
        0xE7, 0x7F, 0x64, 0x11, // random 100 -> g17
        0xE7, 0x7F, 0x64, 0x12, // random 100 -> g18
        0xBA,
    ];
    let mut files = MemFileService::new();
    files.insert("story.dat", story(3, &code));
    let image = MemoryImage::load(&mut files, "story.dat").unwrap();
    let console = Rc::new(RefCell::new(RecordingConsole::new()));
    let mut interpreter = Interpreter::with_options(
        Machine::new(image),
        Box::new(SharedConsole(console)),
        Box::new(files),
        Options::default(),
    );
    interpreter.run().unwrap();
    assert_eq!(interpreter.machine.read_variable(0x10).unwrap(), 1);
    assert_eq!(interpreter.machine.read_variable(0x11).unwrap(), 2);
    assert_eq!(interpreter.machine.read_variable(0x12).unwrap(), 3);
}

#[test]
fn unknown_opcode_is_a_reported_fault() {
    // 0OP:14 is the extended escape, meaningless in v3
    let code = [0xBE];
    let (outcome, _) = run_story(story(3, &code));
    match outcome {
        Err(Fault::UnknownOpcode { pc, .. }) => assert_eq!(pc, 0x800),
        other => panic!("expected an unknown-opcode fault, got {:?}", other),
    }
}

#[test]
fn unsupported_version_fails_to_load() {
    let mut files = MemFileService::new();
    files.insert("story.dat", story(6, &[0xBA]));
    match MemoryImage::load(&mut files, "story.dat") {
        Err(Fault::UnsupportedVersion(6)) => {}
        other => panic!("expected an unsupported-version fault, got {:?}", other),
    }
}

#[test]
fn writes_into_static_memory_fault() {
    // storeb 0x900 0 1: the target sits above the static boundary
    let code = [0xE2, 0x17, 0x09, 0x00, 0x00, 0x01, 0xBA];
    let (outcome, _) = run_story(story(3, &code));
    assert!(matches!(outcome, Err(Fault::StaticWrite { .. })));
}

#[test]
fn restart_resets_dynamic_memory_and_continues() {
    // g16 starts 0: inc g16 ; je g16 2 ?DONE ; restart ; DONE: print "x" quit
    let code = [
        0x95, 0x10, // inc g16
        0x41, 0x10, 0x02, 0xC3, // je g16 2 ?+3 -> DONE
        0xB7, // restart
        0xB2, 0xF4, 0xA5, // DONE: print "x"
        0xBA,
    ];
    // After restart, globals reset to 0, so the loop would never end; use
    // the stack-independent observation that restart keeps running by
    // bounding with step counts instead.
    let mut files = MemFileService::new();
    files.insert("story.dat", story(3, &code));
    let image = MemoryImage::load(&mut files, "story.dat").unwrap();
    let console = Rc::new(RefCell::new(RecordingConsole::new()));
    let mut interpreter = Interpreter::with_options(
        Machine::new(image),
        Box::new(SharedConsole(console)),
        Box::new(files),
        Options::default(),
    );
    for _ in 0..8 {
        interpreter.step().unwrap();
    }
    // Restart must have run at least once and reset the global
    assert!(interpreter.machine.read_variable(0x10).unwrap() <= 1);
    assert_eq!(interpreter.machine.frame_depth(), 1);
}

#[test]
fn seek_and_tell_are_consistent_in_the_file_service() {
    let mut files = MemFileService::new();
    files.insert("blob", vec![1, 2, 3, 4, 5]);
    let h: FileHandle = files.open("blob", FileMode::Read).unwrap();
    files.seek(h, 3, SeekOrigin::Start).unwrap();
    assert_eq!(files.tell(h).unwrap(), 3);
    assert_eq!(files.read_byte(h).unwrap(), 4);
    files.seek(h, -2, SeekOrigin::End).unwrap();
    assert_eq!(files.read_byte(h).unwrap(), 4);
    files.rewind(h).unwrap();
    assert_eq!(files.tell(h).unwrap(), 0);
}
