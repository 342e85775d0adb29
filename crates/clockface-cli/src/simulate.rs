//! Synthetic camera and detector for exercising the engine without hardware.

use anyhow::{bail, Context, Result};
use clockface_core::detector::StreamError;
use clockface_core::{
    stop_pair, template, Descriptor, Detection, Engine, EngineConfig, EnrollmentEvent,
    EnrollmentState, FaceDetector, FrameSource, MemoryRepository, ModelService, StaticThreshold,
    VerificationEvent, DESCRIPTOR_LEN,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

const EMPLOYEE: &str = "sim-0001";
const MAX_RETRIES: usize = 2;
/// Share of frames in which the face leaves the picture.
const DROPOUT: f64 = 0.05;

pub struct Options {
    pub enroll: bool,
    pub verify: bool,
    pub quality: f32,
    pub jitter: f32,
    pub threshold: u8,
    pub seed: Option<u64>,
}

/// What the synthetic sensor captured: the face it saw, if any.
pub struct SyntheticFrame {
    face: Option<(Descriptor, f32)>,
}

pub struct SyntheticCamera {
    rng: StdRng,
    identity: Vec<f32>,
    quality: f32,
    jitter: f32,
}

impl SyntheticCamera {
    fn new(rng: &mut StdRng, identity: &Descriptor, quality: f32, jitter: f32) -> Self {
        Self {
            rng: StdRng::from_rng(rng).unwrap_or_else(|_| StdRng::seed_from_u64(0)),
            identity: identity.values().to_vec(),
            quality,
            jitter: jitter.abs(),
        }
    }
}

impl FrameSource for SyntheticCamera {
    type Frame = SyntheticFrame;

    fn grab(&mut self) -> Result<Option<SyntheticFrame>, StreamError> {
        if self.rng.gen_bool(DROPOUT) {
            return Ok(Some(SyntheticFrame { face: None }));
        }
        let j = self.jitter;
        let values = self
            .identity
            .iter()
            .map(|v| v + self.rng.gen_range(-j..=j))
            .collect();
        let descriptor =
            Descriptor::new(values).map_err(|e| StreamError::Unavailable(e.to_string()))?;
        let quality = self.quality + self.rng.gen_range(-3.0..=3.0);
        Ok(Some(SyntheticFrame {
            face: Some((descriptor, quality)),
        }))
    }
}

pub struct SyntheticDetector;

impl FaceDetector for SyntheticDetector {
    type Frame = SyntheticFrame;

    fn detect(&mut self, frame: &SyntheticFrame) -> Option<Detection> {
        frame
            .face
            .as_ref()
            .map(|(descriptor, quality)| Detection::new(descriptor.clone(), *quality))
    }
}

fn random_identity(rng: &mut StdRng) -> Result<Descriptor> {
    let values = (0..DESCRIPTOR_LEN).map(|_| rng.gen_range(-0.1..0.1)).collect();
    Descriptor::new(values).context("building synthetic identity")
}

pub async fn run(config: EngineConfig, options: Options) -> Result<()> {
    let seed = options.seed.unwrap_or_else(rand::random);
    tracing::info!(seed, quality = options.quality, jitter = options.jitter, "starting simulation");
    let mut rng = StdRng::seed_from_u64(seed);

    let identity = random_identity(&mut rng)?;
    let camera = SyntheticCamera::new(&mut rng, &identity, options.quality, options.jitter);

    let models = Arc::new(ModelService::<SyntheticDetector>::new());
    models.initialize(|| Ok(SyntheticDetector)).await?;

    let repository = Arc::new(MemoryRepository::new());
    if !options.enroll {
        repository.insert_raw(EMPLOYEE, template::serialize(&identity));
    }

    let engine = Engine::new(
        config,
        models,
        camera,
        repository.clone(),
        Arc::new(StaticThreshold(options.threshold)),
    );

    let (handle, mut stop) = stop_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    if options.enroll {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_enrollment(&event);
            }
        });

        let mut controller = engine.begin_enrollment(EMPLOYEE);
        let mut retries = 0;
        let state = loop {
            let state = engine.run_enrollment(&mut controller, &tx, &mut stop).await?;
            match state {
                EnrollmentState::StepFailed(_) if retries < MAX_RETRIES => {
                    retries += 1;
                    for event in controller.retry_step(Instant::now())? {
                        let _ = tx.send(event);
                    }
                }
                other => break other,
            }
        };
        drop(tx);
        printer.await?;

        if state != EnrollmentState::Done {
            bail!("enrollment ended in state {state:?}");
        }
    }

    if options.verify {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_verification(&event);
            }
        });

        let verdict = engine.verify(EMPLOYEE, &tx, &mut stop).await;
        drop(tx);
        printer.await?;

        match verdict? {
            Some(v) => println!(
                "{} similarity={}% threshold={}% confidence={:.1} {}",
                if v.accepted { "ACCEPTED" } else { "REJECTED" },
                v.best_similarity,
                v.threshold,
                v.best_confidence,
                if v.sustained { "(stable)" } else { "(timeout)" },
            ),
            None => println!("verification stopped"),
        }
    }

    Ok(())
}

fn print_enrollment(event: &EnrollmentEvent) {
    match event {
        EnrollmentEvent::StepStarted { step, instruction } => {
            println!("step {}: {instruction}", step + 1);
        }
        EnrollmentEvent::Progress {
            step,
            quality,
            stable_frames,
        } => tracing::debug!(step, ?quality, stable_frames, "enrollment progress"),
        EnrollmentEvent::StepCompleted {
            step,
            score,
            fallback,
        } => {
            let how = if *fallback { " (best frame)" } else { "" };
            println!("step {} done: {score:.1}{how}", step + 1);
        }
        EnrollmentEvent::StepFailed { step, message } => {
            println!("step {} failed: {message}", step + 1);
        }
        EnrollmentEvent::Completed(stored) => {
            println!("enrolled, training score {:.2}", stored.training_score);
        }
        EnrollmentEvent::Failed { message } => println!("enrollment failed: {message}"),
        EnrollmentEvent::Cancelled => println!("enrollment cancelled"),
    }
}

fn print_verification(event: &VerificationEvent) {
    match event {
        VerificationEvent::Progress {
            confidence,
            similarity,
            stable_frames,
        } => tracing::debug!(?confidence, ?similarity, stable_frames, "verification progress"),
        VerificationEvent::Finished(_) => {}
        VerificationEvent::Cancelled => println!("verification cancelled"),
    }
}
