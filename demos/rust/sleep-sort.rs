// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![deny(clippy::all)]

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::clap::{
    Arg,
    ArgMatches,
    Command,
};
use ::corokernel::{
    Config,
    Promise,
    Runtime,
    SharedKernel,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    cell::RefCell,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Program Arguments
//==============================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Numbers to sort.
    count: usize,
    /// Largest number to draw.
    max: u64,
    /// Seed of the random number generator.
    seed: u64,
    /// Optional configuration file.
    config: Option<String>,
}

/// Associate functions for Program Arguments
impl ProgramArguments {
    const DEFAULT_COUNT: usize = 16;
    const DEFAULT_MAX: u64 = 100;
    const DEFAULT_SEED: u64 = 42;

    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("count")
                    .long("count")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("N")
                    .help("Sets how many numbers to sort"),
            )
            .arg(
                Arg::new("max")
                    .long("max")
                    .value_parser(clap::value_parser!(u64))
                    .required(false)
                    .value_name("MILLISECONDS")
                    .help("Sets the largest number to draw"),
            )
            .arg(
                Arg::new("seed")
                    .long("seed")
                    .value_parser(clap::value_parser!(u64))
                    .required(false)
                    .value_name("SEED")
                    .help("Sets the random seed"),
            )
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets the kernel configuration file"),
            )
            .get_matches();

        Ok(Self {
            count: matches.get_one::<usize>("count").copied().unwrap_or(Self::DEFAULT_COUNT),
            max: matches.get_one::<u64>("max").copied().unwrap_or(Self::DEFAULT_MAX),
            seed: matches.get_one::<u64>("seed").copied().unwrap_or(Self::DEFAULT_SEED),
            config: matches.get_one::<String>("config").cloned(),
        })
    }
}

//==============================================================================
// Application
//==============================================================================

/// Sorts numbers by sleeping for as many milliseconds as each number is worth.
struct Application {
    runtime: Runtime,
    numbers: Vec<u64>,
}

impl Application {
    pub fn new(args: &ProgramArguments) -> Result<Self> {
        let config: Config = match &args.config {
            Some(path) => Config::new(path)?,
            None => Config::default(),
        };
        let runtime: Runtime = Runtime::new(&config)?;
        let mut rng: SmallRng = SmallRng::seed_from_u64(args.seed);
        let numbers: Vec<u64> = (0..args.count).map(|_| rng.gen_range(0..=args.max)).collect();
        Ok(Self { runtime, numbers })
    }

    pub fn run(self) -> Result<()> {
        let kernel: SharedKernel = self.runtime.kernel().clone();
        let sorted: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::with_capacity(self.numbers.len())));
        let start: Instant = Instant::now();

        for number in self.numbers.iter().copied() {
            let kernel_: SharedKernel = kernel.clone();
            let sorted_: Rc<RefCell<Vec<u64>>> = sorted.clone();
            let _: Promise<()> = kernel.go(move || async move {
                kernel_.sleep(Duration::from_millis(number)).await?;
                sorted_.borrow_mut().push(number);
                Ok(())
            });
        }
        kernel.run_loop()?;

        let sorted: Vec<u64> = sorted.borrow().clone();
        println!("input:  {:?}", self.numbers);
        println!("output: {:?}", sorted);
        println!("took {:?} over {} ticks", start.elapsed(), kernel.tick_count());
        if sorted.windows(2).any(|pair| pair[0] > pair[1]) {
            anyhow::bail!("output is not sorted");
        }
        Ok(())
    }
}

//==============================================================================
// main()
//==============================================================================

fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new(
        "sleep-sort",
        "Microsoft Corporation",
        "Sorts random numbers with one sleeping coroutine per number.",
    )?;
    Application::new(&args)?.run()
}
