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
    Channel,
    Config,
    Fail,
    Promise,
    Runtime,
    SharedKernel,
    Unblocker,
    WaitGroup,
};
use ::std::{
    io::Read,
    os::unix::net::UnixStream,
    rc::Rc,
    time::Instant,
};

//==============================================================================
// Constants
//==============================================================================

/// Size of a relay buffer.
const BUFFER_SIZE: usize = 4096;

//==============================================================================
// Program Arguments
//==============================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Number of relay coroutines in the chain.
    stages: usize,
    /// Number of bytes pushed through the chain.
    nbytes: usize,
}

/// Associate functions for Program Arguments
impl ProgramArguments {
    const DEFAULT_STAGES: usize = 8;
    const DEFAULT_NBYTES: usize = 1 << 20;

    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("stages")
                    .long("stages")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("N")
                    .help("Sets the number of relay stages"),
            )
            .arg(
                Arg::new("bytes")
                    .long("bytes")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("N")
                    .help("Sets the number of bytes to relay"),
            )
            .get_matches();

        let args: ProgramArguments = ProgramArguments {
            stages: matches.get_one::<usize>("stages").copied().unwrap_or(Self::DEFAULT_STAGES),
            nbytes: matches.get_one::<usize>("bytes").copied().unwrap_or(Self::DEFAULT_NBYTES),
        };
        if args.stages == 0 {
            anyhow::bail!("at least one relay stage is required");
        }
        Ok(args)
    }
}

//==============================================================================
// Application
//==============================================================================

/// Pushes bytes through a chain of socket pairs, one relay coroutine per link.
struct Application {
    runtime: Runtime,
    stages: usize,
    nbytes: usize,
}

impl Application {
    pub fn new(args: &ProgramArguments) -> Result<Self> {
        let runtime: Runtime = Runtime::new(&Config::default())?;
        Ok(Self {
            runtime,
            stages: args.stages,
            nbytes: args.nbytes,
        })
    }

    pub fn run(self) -> Result<()> {
        let kernel: SharedKernel = self.runtime.kernel().clone();
        let relays: WaitGroup = WaitGroup::new(&kernel);
        let reports: Channel<(usize, usize)> = Channel::new(&kernel, self.stages);

        let (head, mut upstream): (UnixStream, UnixStream) = UnixStream::pair()?;
        let head: Unblocker = kernel.unblock(Rc::new(head))?;
        for stage in 0..self.stages {
            let (downstream, next): (UnixStream, UnixStream) = UnixStream::pair()?;
            let input: Unblocker = kernel.unblock(Rc::new(upstream))?;
            let output: Unblocker = kernel.unblock(Rc::new(downstream))?;
            upstream = next;

            relays.add(1);
            let relays_: WaitGroup = relays.clone();
            let reports_: Channel<(usize, usize)> = reports.clone();
            let _: Promise<()> = kernel.go(move || async move {
                let relayed: Result<usize, Fail> = relay(&input, &output).await;
                input.close();
                output.close();
                relays_.done();
                reports_.send((stage, relayed?)).await
            });
        }
        let tail: Unblocker = kernel.unblock(Rc::new(upstream))?;

        let nbytes: usize = self.nbytes;
        let _: Promise<()> = kernel.go(move || async move {
            let chunk: Vec<u8> = (0..BUFFER_SIZE).map(|i| i as u8).collect();
            let mut remaining: usize = nbytes;
            while remaining > 0 {
                let len: usize = remaining.min(chunk.len());
                head.write_all(&chunk[..len]).await?;
                remaining -= len;
            }
            head.close();
            Ok(())
        });

        let start: Instant = Instant::now();
        let mut received: Vec<u8> = Vec::with_capacity(self.nbytes);
        tail.blocking().read_to_end(&mut received)?;
        kernel.block_on(relays.wait())?;

        for _ in 0..self.stages {
            let (stage, relayed): (usize, usize) = kernel.block_on(reports.receive())?;
            println!("stage {}: relayed {} bytes", stage, relayed);
        }
        println!("relayed {} bytes through {} stages in {:?}", received.len(), self.stages, start.elapsed());
        if received.len() != self.nbytes {
            anyhow::bail!("expected {} bytes, got {}", self.nbytes, received.len());
        }
        if received.iter().enumerate().any(|(i, byte)| *byte != (i % BUFFER_SIZE) as u8) {
            anyhow::bail!("relayed bytes were corrupted");
        }
        Ok(())
    }
}

/// Copies `input` into `output` until the end of the stream.
async fn relay(input: &Unblocker, output: &Unblocker) -> Result<usize, Fail> {
    let mut buf: [u8; BUFFER_SIZE] = [0; BUFFER_SIZE];
    let mut total: usize = 0;
    loop {
        match input.read(&mut buf).await? {
            0 => return Ok(total),
            nbytes => {
                output.write_all(&buf[..nbytes]).await?;
                total += nbytes;
            },
        }
    }
}

//==============================================================================
// main()
//==============================================================================

fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new(
        "pipe-relay",
        "Microsoft Corporation",
        "Relays bytes through a chain of socket pairs, one coroutine per link.",
    )?;
    Application::new(&args)?.run()
}
