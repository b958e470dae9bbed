//! Interactive console for DLL injection mode.
//!
//! When the library is loaded as a DLL into a host process, this module opens a console
//! window with a small REPL for inspecting the host's address space.

#[cfg(target_os = "windows")]
use std::io::{self, BufRead, Write};
#[cfg(target_os = "windows")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(target_os = "windows")]
use std::sync::{Arc, Mutex};
#[cfg(target_os = "windows")]
use std::thread::{self, JoinHandle};

#[cfg(target_os = "windows")]
use bytesize::ByteSize;
#[cfg(target_os = "windows")]
use windows::core::PCSTR;
#[cfg(target_os = "windows")]
use windows::Win32::System::Console::{
    AllocConsole, FreeConsole, GetConsoleMode, SetConsoleMode, SetConsoleTitleA, CONSOLE_MODE,
    ENABLE_VIRTUAL_TERMINAL_PROCESSING,
};

#[cfg(target_os = "windows")]
use crate::layout::walk;
#[cfg(target_os = "windows")]
use crate::memory::{AddressSpace, CurrentProcess, RegionState, PAGE_SIZE};
#[cfg(target_os = "windows")]
use crate::protection;
#[cfg(target_os = "windows")]
use crate::report;

/// Console state and settings.
#[cfg(target_os = "windows")]
pub struct Console {
    /// Console thread handle.
    thread: Option<JoinHandle<()>>,
    /// Flag to signal shutdown.
    should_exit: Arc<AtomicBool>,
    /// Max regions printed by `regions`.
    region_limit: usize,
    /// Include free regions in the region list.
    show_free: bool,
}

#[cfg(target_os = "windows")]
impl Console {
    /// Create a new console instance.
    pub fn new() -> Self {
        Self {
            thread: None,
            should_exit: Arc::new(AtomicBool::new(false)),
            region_limit: 64,
            show_free: false,
        }
    }

    /// Start the console in a new thread.
    pub fn start(&mut self) -> bool {
        if self.thread.is_some() {
            return true;
        }

        // Allocate console and redirect stdio
        unsafe {
            let _ = AllocConsole();

            let _ = SetConsoleTitleA(PCSTR(b"vmpatch - address space console\0".as_ptr()));

            // Reopen stdio to the new console; injected DLLs do not get it automatically.
            use windows::Win32::Storage::FileSystem::{
                CreateFileA, FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_READ,
                FILE_SHARE_WRITE, OPEN_EXISTING,
            };
            use windows::Win32::System::Console::{
                GetStdHandle, SetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
            };

            let conin = CreateFileA(
                PCSTR(b"CONIN$\0".as_ptr()),
                FILE_GENERIC_READ.0,
                FILE_SHARE_READ,
                None,
                OPEN_EXISTING,
                Default::default(),
                None,
            );

            let conout = CreateFileA(
                PCSTR(b"CONOUT$\0".as_ptr()),
                FILE_GENERIC_WRITE.0,
                FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                Default::default(),
                None,
            );

            if let (Ok(cin), Ok(cout)) = (conin, conout) {
                let _ = SetStdHandle(STD_INPUT_HANDLE, cin);
                let _ = SetStdHandle(STD_OUTPUT_HANDLE, cout);
                let _ = SetStdHandle(STD_ERROR_HANDLE, cout);
            }

            // Try to enable ANSI escape sequences
            if let Ok(handle) = GetStdHandle(STD_OUTPUT_HANDLE) {
                let mut mode = CONSOLE_MODE::default();
                if GetConsoleMode(handle, &mut mode).is_ok() {
                    let _ = SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING);
                }
            }
        }

        let mut state = ConsoleState {
            should_exit: self.should_exit.clone(),
            region_limit: self.region_limit,
            show_free: self.show_free,
        };

        self.thread = Some(thread::spawn(move || state.run()));
        true
    }

    /// Stop the console.
    pub fn stop(&mut self) {
        self.should_exit.store(true, Ordering::SeqCst);

        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }

        unsafe {
            let _ = FreeConsole();
        }
    }
}

#[cfg(target_os = "windows")]
impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "windows")]
impl Drop for Console {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Internal console state for the worker thread.
#[cfg(target_os = "windows")]
struct ConsoleState {
    should_exit: Arc<AtomicBool>,
    region_limit: usize,
    show_free: bool,
}

#[cfg(target_os = "windows")]
impl ConsoleState {
    fn run(&mut self) {
        self.print_banner();
        self.print_status();
        println!("\nType 'help' for available commands.\n");

        let stdin = io::stdin();

        while !self.should_exit.load(Ordering::SeqCst) {
            print!("vmpatch> ");
            let _ = io::stdout().flush();

            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break, // EOF
                Ok(_) => {}
                Err(_) => break,
            }

            let cmd = line.trim().to_lowercase();
            if cmd.is_empty() {
                continue;
            }

            match cmd.as_str() {
                "help" | "h" | "?" => self.print_help(),
                "status" | "s" => self.print_status(),
                "stats" | "walk" | "w" => self.cmd_stats(),
                "histogram" | "hist" => self.cmd_histogram(),
                "regions" | "r" => self.cmd_regions(),
                "protect" | "prot" | "p" => self.cmd_decode_protection(),
                "limit" | "l" => self.cmd_set_limit(),
                "showfree" | "sf" => self.cmd_toggle_show_free(),
                "quit" | "exit" | "q" => {
                    println!("Goodbye!");
                    self.should_exit.store(true, Ordering::SeqCst);
                }
                "clear" | "cls" => {
                    print!("\x1B[2J\x1B[H"); // ANSI clear screen
                    let _ = io::stdout().flush();
                    self.print_banner();
                }
                _ => {
                    println!("[ERROR] Unknown command: {}", cmd);
                    println!("Type 'help' for available commands.");
                }
            }
        }
    }

    fn print_banner(&self) {
        println!();
        println!(" vmpatch - address space statistics and code patching");
        println!(" Version {} | PID: {}", env!("CARGO_PKG_VERSION"), std::process::id());
        println!();
    }

    fn print_help(&self) {
        println!();
        println!("=== Available Commands ===");
        println!();
        println!("  [Inspection]");
        println!("    stats, walk, w       - Walk the address space and print statistics");
        println!("    histogram, hist      - Print the free span histogram");
        println!("    regions, r           - List regions with their protection");
        println!("    protect, prot, p     - Decode a page protection value");
        println!();
        println!("  [Configuration]");
        println!("    limit, l             - Set max regions listed");
        println!("    showfree, sf         - Toggle free regions in the list");
        println!();
        println!("  [Console]");
        println!("    status, s            - Show current settings");
        println!("    help, h, ?           - Show this help");
        println!("    clear, cls           - Clear screen");
        println!("    quit, exit, q        - Exit console");
        println!();
    }

    fn print_status(&self) {
        let bounds = CurrentProcess.bounds();

        println!();
        println!("=== Current Settings ===");
        println!(
            "  Address Range:    0x{:X} - 0x{:X} ({})",
            bounds.lowest,
            bounds.highest,
            ByteSize::b(bounds.len() as u64)
        );
        println!("  Region Limit:     {}", self.region_limit);
        println!("  Show Free:        {}", if self.show_free { "Yes" } else { "No" });
        println!();
    }

    fn cmd_stats(&self) {
        let bounds = CurrentProcess.bounds();

        match walk(&CurrentProcess) {
            Ok(snapshot) => {
                println!();
                print!("{}", report::render(&snapshot, bounds.len() as u64));
                println!();
                println!(
                    "[OK] {} scanned, {} free",
                    ByteSize::b(snapshot.total_pages() * PAGE_SIZE as u64),
                    ByteSize::b(snapshot.free_pages * PAGE_SIZE as u64)
                );
            }
            Err(e) => println!("[ERROR] Walk failed: {}", e),
        }
        println!();
    }

    fn cmd_histogram(&self) {
        let bounds = CurrentProcess.bounds();

        match walk(&CurrentProcess) {
            Ok(snapshot) => {
                println!();
                print!("{}", report::render_histogram(&snapshot, bounds.len() as u64));
            }
            Err(e) => println!("[ERROR] Walk failed: {}", e),
        }
        println!();
    }

    fn cmd_regions(&self) {
        let memory = CurrentProcess;
        let bounds = memory.bounds();
        let mut cursor = bounds.lowest;
        let mut shown = 0;

        println!();
        println!("  {:<18} {:>10} {:<10} {:<8} Protection", "Base", "Size", "State", "Type");
        println!("  {:-<70}", "");

        while cursor < bounds.highest && shown < self.region_limit {
            let region = match memory.query(cursor) {
                Ok(region) => region,
                Err(e) => {
                    println!("[ERROR] {}", e);
                    break;
                }
            };

            if region.state != RegionState::Free || self.show_free {
                let (kind, protect) = match region.state {
                    RegionState::Free => ("-".to_string(), String::new()),
                    RegionState::Reserved => (format!("{:?}", region.kind), String::new()),
                    RegionState::Committed => {
                        (format!("{:?}", region.kind), protection::describe(region.protect))
                    }
                };

                println!(
                    "  0x{:016X} {:>10} {:<10} {:<8} {}",
                    region.base,
                    ByteSize::b(region.size as u64).to_string(),
                    format!("{:?}", region.state),
                    kind,
                    protect
                );
                shown += 1;
            }

            match region.end() {
                Some(end) if end > cursor => cursor = end,
                _ => break,
            }
        }

        if shown == self.region_limit {
            println!("  ... limit of {} regions reached", self.region_limit);
        }
        println!();
    }

    fn cmd_decode_protection(&self) {
        print!("Protection value (e.g. 0x40): ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_ok() {
            match protection::parse(&input) {
                Some(value) => println!("0x{:X} = {}", value, protection::describe(value)),
                None => println!("[ERROR] Not a number: {}", input.trim()),
            }
        }
    }

    fn cmd_set_limit(&mut self) {
        print!("Max regions listed [{}]: ", self.region_limit);
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_ok() {
            if let Ok(limit) = input.trim().parse::<usize>() {
                self.region_limit = limit;
            }
        }
        println!("[OK] Region limit set to: {}", self.region_limit);
    }

    fn cmd_toggle_show_free(&mut self) {
        self.show_free = !self.show_free;
        println!(
            "[OK] Show free regions: {}",
            if self.show_free { "Yes" } else { "No" }
        );
    }
}

// Global console instance
#[cfg(target_os = "windows")]
static CONSOLE: Mutex<Option<Console>> = Mutex::new(None);

/// Start the global console.
#[cfg(target_os = "windows")]
pub fn start_console() {
    if let Ok(mut slot) = CONSOLE.lock() {
        if slot.is_none() {
            let mut console = Console::new();
            console.start();
            *slot = Some(console);
        }
    }
}

/// Stop the global console.
#[cfg(target_os = "windows")]
pub fn stop_console() {
    let console = CONSOLE.lock().ok().and_then(|mut slot| slot.take());
    if let Some(mut console) = console {
        console.stop();
    }
}

// Stub implementations for non-Windows
#[cfg(not(target_os = "windows"))]
pub fn start_console() {}

#[cfg(not(target_os = "windows"))]
pub fn stop_console() {}
