//! A diagnostic tool for SPI NAND flash, real or emulated.
//!
//! Everything goes through the block-device interface, so this doubles as a way to exercise it
//! interactively against a real chip.

use anyhow::{ensure, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use spi_nand_flash::blockdev::{IoctlCmd, IoctlReply};
use spi_nand_flash::emul::{EmulConfig, EmulLayout, DEFAULT_EMULATED_SIZE};
#[cfg(target_os = "linux")]
use spi_nand_flash::spi::spidev::SpidevTransport;
use spi_nand_flash::spi::IoMode;
use spi_nand_flash::{get_blockdev, BlockDevice, FlashConfig};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logging(verbose: u8) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    });
}

#[derive(Args, Debug)]
struct FlashOptions {
    /// Path to a `/dev/spidevB.C` device with the chip on it
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash")]
    spidev: Option<PathBuf>,

    /// SPI clock rate
    #[cfg(target_os = "linux")]
    #[clap(long, default_value_t = 10_000_000)]
    speed_hz: u32,

    /// Which data lines to use: sio, dout, dio, qout or qio
    #[clap(long, default_value = "sio")]
    io_mode: IoMode,

    /// Emulate a chip backed by this file, created if it does not exist
    ///
    /// A file of a size other than --emul-size is erased. The file is removed when done unless
    /// --keep-dump is given.
    #[clap(long, group = "flash")]
    emul_path: Option<PathBuf>,

    /// Emulate a chip backed by a temporary file
    #[clap(long, group = "flash")]
    emul: bool,

    /// Size of the emulation file, OOB included
    #[clap(long, default_value_t = DEFAULT_EMULATED_SIZE)]
    emul_size: u64,

    /// Layout of the emulated chip, as PAGESxBYTES
    #[clap(long, default_value = "64x2048")]
    emul_layout: EmulLayout,

    /// Keep the emulation file when done
    #[clap(long)]
    keep_dump: bool,
}

impl FlashOptions {
    fn open(&self) -> Result<Box<dyn BlockDevice>> {
        let config = if self.emul || self.emul_path.is_some() {
            FlashConfig::Emulated(EmulConfig {
                path: self.emul_path.clone(),
                size: self.emul_size,
                keep_dump: self.keep_dump,
                layout: self.emul_layout,
            })
        } else {
            #[cfg(target_os = "linux")]
            {
                let Some(path) = &self.spidev else {
                    unreachable!()
                };
                let transport = SpidevTransport::open(path, self.speed_hz, self.io_mode)?;
                FlashConfig::Spi {
                    transport: Box::new(transport),
                    io_mode: self.io_mode,
                }
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(get_blockdev(config)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print what the chip identified as, and its geometry
    Info,

    /// Count the bad blocks
    BadBlocks {
        /// Also list each bad block
        #[clap(long)]
        list: bool,
    },

    /// Summarize ECC results over every programmed page
    EccStats,

    /// Mark a block bad; this erases it and cannot be undone
    MarkBad { block: u32 },

    /// Dump one page as hex, or into a file
    ReadPage {
        page: u32,

        /// Write the page here instead of dumping it
        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// Program one page from a file, padded with 0xFF to the page size
    WritePage { page: u32, path: PathBuf },

    /// Erase one block
    EraseBlock { block: u32 },

    /// Measure erase, program and read throughput; destroys the content of the blocks used
    Bench {
        /// First block to use
        #[clap(long, default_value_t = 0)]
        start: u32,

        /// How many blocks to use
        #[clap(long, default_value_t = 8)]
        blocks: u32,
    },
}

fn hexdump(data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:08x}  {}", i * 16, hex.join(" "));
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / (1024.0 * 1024.0)
}

impl Command {
    fn execute(self, dev: &dyn BlockDevice) -> Result<()> {
        let page_size = dev.geometry().write_size as usize;
        let block_size = dev.geometry().erase_size as usize;

        match self {
            Command::Info => {
                let IoctlReply::FlashInfo {
                    device_info,
                    geometry,
                } = dev.ioctl(IoctlCmd::GetNandFlashInfo)?
                else {
                    unreachable!()
                };

                println!("Chip:         {}", device_info.chip_name);
                println!("Manufacturer: {:#04x}", device_info.manufacturer_id);
                println!("Device:       {:#06x}", device_info.device_id);
                println!(
                    "Layout:       {} blocks x {} pages x {} bytes (+{} OOB)",
                    geometry.num_blocks,
                    geometry.pages_per_block(),
                    geometry.page_size,
                    geometry.oob_size
                );
                println!("Planes:       {}", geometry.num_planes);
                println!("Capacity:     {} bytes", geometry.capacity());
                println!(
                    "ECC:          {}-bit status, refresh at {} bits",
                    geometry.ecc.status_reg_len_in_bits, geometry.ecc.refresh_threshold
                );
            }

            Command::BadBlocks { list } => {
                if list {
                    let blocks = dev.geometry().disk_size / block_size as u64;
                    for block in 0..blocks as u32 {
                        if dev.ioctl(IoctlCmd::IsBadBlock(block))? == IoctlReply::BadBlock(true) {
                            println!("{block:6} bad");
                        }
                    }
                }

                if let IoctlReply::BadBlockCount(count) = dev.ioctl(IoctlCmd::GetBadBlocksCount)? {
                    println!("Bad blocks: {count}");
                }
            }

            Command::EccStats => {
                if let IoctlReply::EccStats(stats) = dev.ioctl(IoctlCmd::GetEccStats)? {
                    println!("Pages with ECC events: {}", stats.total_err_count);
                    println!("  uncorrectable:       {}", stats.uncorrected_count);
                    println!(
                        "  at/above {} bits:     {}",
                        stats.threshold, stats.exceeding_threshold_count
                    );
                }
            }

            Command::MarkBad { block } => {
                dev.ioctl(IoctlCmd::MarkBadBlock(block))?;
                println!("Block {block} marked bad");
            }

            Command::ReadPage { page, out } => {
                let mut buf = vec![0; page_size];
                let status = dev.read(&mut buf, page as u64 * page_size as u64, page_size)?;
                eprintln!("ECC: {status:?}");

                match out {
                    Some(path) => fs::write(path, &buf)?,
                    None => hexdump(&buf),
                }
            }

            Command::WritePage { page, path } => {
                let mut data = fs::read(path)?;
                ensure!(
                    data.len() <= page_size,
                    "file is {} bytes, larger than a page",
                    data.len()
                );
                data.resize(page_size, 0xFF);
                dev.write(&data, page as u64 * page_size as u64, page_size)?;
            }

            Command::EraseBlock { block } => {
                dev.erase(block as u64 * block_size as u64, block_size)?;
            }

            Command::Bench { start, blocks } => {
                let rpt = howudoin::new()
                    .label("Benchmarking")
                    .set_len(u64::from(blocks));

                let pattern: Vec<u8> = (0..block_size).map(|i| (i % 253) as u8).collect();
                let mut readback = vec![0; page_size];
                let (mut erase, mut program, mut read) =
                    (Duration::ZERO, Duration::ZERO, Duration::ZERO);
                let mut used = 0u64;

                for block in start..start + blocks {
                    rpt.inc();
                    if dev.ioctl(IoctlCmd::IsBadBlock(block))? == IoctlReply::BadBlock(true) {
                        rpt.add_info(&format!("skipping bad block {block}"));
                        continue;
                    }
                    let addr = block as u64 * block_size as u64;

                    let t = Instant::now();
                    dev.erase(addr, block_size)?;
                    erase += t.elapsed();

                    let t = Instant::now();
                    dev.write(&pattern, addr, block_size)?;
                    program += t.elapsed();

                    let t = Instant::now();
                    for (i, expected) in pattern.chunks_exact(page_size).enumerate() {
                        let page_addr = addr + (i * page_size) as u64;
                        dev.read(&mut readback, page_addr, page_size)?;
                        ensure!(readback == expected, "readback mismatch at {page_addr:#x}");
                    }
                    read += t.elapsed();

                    used += 1;
                }
                rpt.close();

                let bytes = used * block_size as u64;
                println!("{used} blocks");
                println!("erase:   {:8.2} MiB/s", rate(bytes, erase));
                println!("program: {:8.2} MiB/s", rate(bytes, program));
                println!("read:    {:8.2} MiB/s", rate(bytes, read));
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
#[clap(group(ArgGroup::new("flash").required(true)))]
struct Cli {
    /// The chip to use
    #[clap(flatten)]
    flash: FlashOptions,

    /// More logging; repeat for more
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The command to run against the chip
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);
    howudoin::init(howudoin::consumers::TermLine::default());

    let dev = args.flash.open()?;
    let result = args.cmd.execute(dev.as_ref());

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    result?;
    dev.sync()?;
    dev.release()?;
    Ok(())
}
