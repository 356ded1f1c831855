use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use ctxpool::{
    Frame, PoolOptions, PoolStats, RenderBackend, ResourcePool, SoftwareBackend, EFFECT_PROGRAMS,
};
use futures::executor::LocalPool;
use image::RgbaImage;
use lifecycle::{CardEvent, CardHost, CardId, CardRenderer, LifecycleState, Position};
use poolconfig::CardPoolConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

const COLUMNS: usize = 4;
const GUTTER: f32 = 24.0;
/// Viewport height measured in card rows.
const VIEWPORT_ROWS: f32 = 2.5;

/// Backends the simulation knows how to paint a card on.
pub trait CardPainter: RenderBackend<Snapshot = RgbaImage> + Sized + 'static {
    const NAME: &'static str;

    fn paint(frame: &mut Frame<'_, Self>, style: &CardStyle, elapsed: Duration) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardStyle {
    pub effect: &'static str,
    pub hue: f32,
}

impl CardPainter for SoftwareBackend {
    const NAME: &'static str = "software";

    fn paint(frame: &mut Frame<'_, Self>, style: &CardStyle, elapsed: Duration) -> Result<()> {
        let program = frame
            .shared()
            .program(style.effect)
            .ok_or_else(|| anyhow!("effect {} is not compiled", style.effect))?;
        let noise = {
            let noise = &frame.shared().noise;
            let x = program.id % noise.width().max(1);
            noise.get_pixel(x, 0).0[0]
        };
        let phase = (style.hue + elapsed.as_secs_f32() * 0.25).fract();
        let shade = (phase * 255.0) as u8;
        frame
            .context_mut()
            .fill([shade, noise, 255 - shade, 255]);
        Ok(())
    }
}

#[cfg(feature = "wgpu")]
impl CardPainter for ctxpool::GpuBackend {
    const NAME: &'static str = "wgpu";

    fn paint(frame: &mut Frame<'_, Self>, style: &CardStyle, elapsed: Duration) -> Result<()> {
        let backend = frame.backend();
        let (context, shared) = frame.parts_mut();
        backend.draw_effect(
            context,
            shared,
            style.effect,
            ctxpool::EffectUniforms {
                pointer: [0.5, 0.5],
                time: elapsed.as_secs_f32() + style.hue,
                intensity: 1.0,
            },
        )?;
        Ok(())
    }
}

struct SimCard {
    position: Position,
    style: CardStyle,
}

impl<B: CardPainter> CardRenderer<B> for SimCard {
    fn position(&self) -> Position {
        self.position
    }

    fn init(&mut self, frame: &mut Frame<'_, B>) -> Result<()> {
        let style = self.style.clone();
        frame.cache().get_or_insert_with("style", move || style);
        Ok(())
    }

    fn draw(&mut self, frame: &mut Frame<'_, B>, elapsed: Duration) -> Result<()> {
        B::paint(frame, &self.style, elapsed)
    }
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub cards: usize,
    pub ticks: u64,
    pub tick: Duration,
    pub seed: u64,
    pub snapshots: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub backend: &'static str,
    pub seed: u64,
    pub cards: usize,
    pub ticks: u64,
    pub pool_size: usize,
    pub batch_limit: usize,
    pub peak_in_use: usize,
    pub peak_queue_length: usize,
    pub frames_drawn: u64,
    pub deactivations: usize,
    pub timed_out: usize,
    pub recovered: usize,
    pub failures: usize,
    pub torn_down: usize,
    pub stills: usize,
    pub snapshots_written: usize,
    pub final_pool: PoolStats,
    pub states: BTreeMap<LifecycleState, usize>,
}

struct PageCard {
    id: CardId,
    index: usize,
}

struct Layout {
    card_width: f32,
    card_height: f32,
    viewport: f32,
    max_scroll: f32,
}

impl Layout {
    fn new(config: &CardPoolConfig, cards: usize) -> Self {
        let card_width = config.pool.width as f32;
        let card_height = config.pool.height as f32;
        let row = card_height + GUTTER;
        let rows = cards.div_ceil(COLUMNS) as f32;
        let viewport = row * VIEWPORT_ROWS;
        Self {
            card_width,
            card_height,
            viewport,
            max_scroll: (rows * row - viewport).max(0.0),
        }
    }

    fn position(&self, index: usize) -> Position {
        let row = (index / COLUMNS) as f32;
        let column = (index % COLUMNS) as f32;
        Position::new(
            row * (self.card_height + GUTTER),
            column * (self.card_width + GUTTER),
        )
    }

    fn intersection(&self, index: usize, scroll: f32) -> f32 {
        let top = self.position(index).top;
        let bottom = top + self.card_height;
        let overlap = (bottom.min(scroll + self.viewport) - top.max(scroll)).max(0.0);
        overlap / self.card_height
    }
}

/// Runs a seeded scroll and pointer workload over a page of cards.
pub fn simulate<B: CardPainter>(
    backend: B,
    config: &CardPoolConfig,
    options: &SimulationOptions,
) -> Result<SimulationReport> {
    let mut executor = LocalPool::new();
    let pool = ResourcePool::new(backend, PoolOptions::from_config(config))
        .context("failed to build context pool")?;
    let host = CardHost::new(pool, executor.spawner(), config);
    let layout = Layout::new(config, options.cards);
    let mut rng = StdRng::seed_from_u64(options.seed);

    let mut page: Vec<PageCard> = (0..options.cards)
        .map(|index| PageCard {
            id: host.register(sim_card(&layout, index, &mut rng)),
            index,
        })
        .collect();

    info!(
        backend = B::NAME,
        cards = options.cards,
        pool = host.pool().capacity(),
        batch = host.scheduler().batch_limit(),
        seed = options.seed,
        "starting simulation"
    );

    let mut report = SimulationReport {
        backend: B::NAME,
        seed: options.seed,
        cards: options.cards,
        ticks: options.ticks,
        pool_size: host.pool().capacity(),
        batch_limit: host.scheduler().batch_limit(),
        peak_in_use: 0,
        peak_queue_length: 0,
        frames_drawn: 0,
        deactivations: 0,
        timed_out: 0,
        recovered: 0,
        failures: 0,
        torn_down: 0,
        stills: 0,
        snapshots_written: 0,
        final_pool: PoolStats::default(),
        states: BTreeMap::new(),
    };

    let start = Instant::now();
    let mut scroll = 0.0_f32;
    let mut hovered: Option<CardId> = None;

    for step in 0..options.ticks {
        let now = start
            .checked_add(clock_offset(options.tick, step))
            .ok_or_else(|| anyhow!("simulated clock overflowed at tick {step}"))?;

        if rng.gen_bool(0.25) {
            scroll = (scroll + rng.gen_range(-80.0..=160.0)).clamp(0.0, layout.max_scroll);
        }
        for card in &page {
            host.set_intersection(card.id, layout.intersection(card.index, scroll))?;
        }

        let visible: Vec<CardId> = page
            .iter()
            .filter(|card| layout.intersection(card.index, scroll) > 0.0)
            .map(|card| card.id)
            .collect();
        if !visible.is_empty() && rng.gen_bool(0.06) {
            let target = visible[rng.gen_range(0..visible.len())];
            if hovered != Some(target) {
                if let Some(previous) = hovered.take() {
                    host.pointer_leave(previous, now)?;
                }
                host.pointer_enter(target)?;
                hovered = Some(target);
            }
        } else if rng.gen_bool(0.02) {
            if let Some(previous) = hovered.take() {
                host.pointer_leave(previous, now)?;
            }
        }

        if !page.is_empty() && rng.gen_bool(0.005) {
            let id = page[rng.gen_range(0..page.len())].id;
            if rng.gen_bool(0.5) {
                host.start(id)?;
            } else {
                host.stop(id, now)?;
            }
        }

        if !page.is_empty() && rng.gen_bool(0.004) {
            let slot = rng.gen_range(0..page.len());
            let old = page[slot].id;
            if hovered == Some(old) {
                hovered = None;
            }
            host.teardown(old)?;
            let index = page[slot].index;
            page[slot].id = host.register(sim_card(&layout, index, &mut rng));
            report.torn_down += 1;
            debug!(card = %old, replacement = %page[slot].id, "card replaced");
        }

        executor.run_until_stalled();
        let tick = host.tick(now);
        executor.run_until_stalled();

        report.frames_drawn += tick.frames_drawn as u64;
        report.deactivations += tick.deactivated;
        report.timed_out += tick.timed_out;
        report.recovered += tick.recovered;

        let stats = host.pool().stats();
        report.peak_in_use = report.peak_in_use.max(stats.in_use);
        report.peak_queue_length = report.peak_queue_length.max(stats.queue_length);

        for event in host.drain_events() {
            if let CardEvent::Failed { card, reason } = event {
                warn!(card = %card, reason = %reason, "card failed");
                report.failures += 1;
            }
        }
    }

    report.final_pool = host.pool().stats();
    report.states = host.state_counts();
    report.stills = page
        .iter()
        .filter(|card| host.snapshot(card.id).is_some())
        .count();

    if let Some(dir) = &options.snapshots {
        report.snapshots_written = write_snapshots(&host, &page, dir)?;
    }

    host.shutdown();
    executor.run_until_stalled();
    info!(
        frames = report.frames_drawn,
        peak_in_use = report.peak_in_use,
        failures = report.failures,
        "simulation finished"
    );
    Ok(report)
}

/// Simulated time elapsed before tick `step`.
fn clock_offset(tick: Duration, step: u64) -> Duration {
    let nanos = tick.as_nanos().saturating_mul(u128::from(step));
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}

fn sim_card(layout: &Layout, index: usize, rng: &mut StdRng) -> SimCard {
    SimCard {
        position: layout.position(index),
        style: CardStyle {
            effect: EFFECT_PROGRAMS[rng.gen_range(0..EFFECT_PROGRAMS.len())],
            hue: rng.gen_range(0.0..1.0),
        },
    }
}

fn write_snapshots<B: CardPainter>(
    host: &CardHost<B>,
    page: &[PageCard],
    dir: &std::path::Path,
) -> Result<usize> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create snapshot directory {}", dir.display()))?;
    let mut written = 0;
    for card in page {
        let Some(still) = host.snapshot(card.id) else {
            continue;
        };
        let path = dir.join(format!("card-{:03}.png", card.index));
        still
            .save(&path)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(cards: usize, ticks: u64, seed: u64) -> SimulationOptions {
        SimulationOptions {
            cards,
            ticks,
            tick: Duration::from_millis(16),
            seed,
            snapshots: None,
        }
    }

    fn small_config(size: usize) -> CardPoolConfig {
        let mut config = CardPoolConfig::default();
        config.pool.size = size;
        config.pool.width = 16;
        config.pool.height = 12;
        config
    }

    #[test]
    fn clock_offset_does_not_wrap_past_u32_ticks() {
        let tick = Duration::from_millis(16);
        assert_eq!(clock_offset(tick, 0), Duration::ZERO);
        assert_eq!(clock_offset(tick, 3), Duration::from_millis(48));
        let far = u64::from(u32::MAX) + 2;
        assert_eq!(clock_offset(tick, far), Duration::from_millis(16 * far));
        assert!(clock_offset(tick, far) > clock_offset(tick, u64::from(u32::MAX)));
    }

    #[test]
    fn intersection_tracks_scroll() {
        let config = small_config(2);
        let layout = Layout::new(&config, 16);
        assert_eq!(layout.intersection(0, 0.0), 1.0);
        assert_eq!(layout.intersection(COLUMNS * 3, 0.0), 0.0);
        let half = layout.intersection(0, config.pool.height as f32 / 2.0);
        assert!((half - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn pool_never_exceeds_capacity() {
        let backend = SoftwareBackend::new();
        let report = simulate(backend.clone(), &small_config(3), &options(20, 400, 9)).unwrap();
        assert!(report.peak_in_use <= 3);
        assert!(report.peak_in_use > 0);
        assert!(report.stills > 0);
        assert_eq!(report.states.values().sum::<usize>(), 20);
        assert_eq!(report.states[&LifecycleState::Idle], 0);
        assert_eq!(backend.live_contexts(), 0);
    }

    #[test]
    fn same_seed_same_report() {
        let first = simulate(SoftwareBackend::new(), &small_config(2), &options(12, 200, 4)).unwrap();
        let second =
            simulate(SoftwareBackend::new(), &small_config(2), &options(12, 200, 4)).unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }
}
