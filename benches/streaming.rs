use criterion::{criterion_group, criterion_main, Criterion, black_box};

use std::sync::Arc;

use glam::DVec2;

use lodterra::data::column::{build_column, AlwaysVisible, ColumnView, CompressionMode, RawBlock, SkipEnclosed};
use lodterra::data::disk_io::{compress_data_source, decompress_data_source, serialize_data_source};
use lodterra::data::{data_point, DictionaryEntry, EntryPool, FullDataSource, SECTION_WIDTH};
use lodterra::math::{DetailCurve, SectionPos};
use lodterra::streaming::{BoxFuture, BufferBuilder, DataSourceProvider, LevelContext, RenderBuffer};
use lodterra::{LodCache, LodCacheConfig, Result};

/// 320 blocks: bedrock, stone, a dirt band, grass, then air
fn layered_column() -> Vec<RawBlock> {
    let mut blocks = Vec::with_capacity(320);
    blocks.push(RawBlock::new(0, 0, 0));
    blocks.extend(std::iter::repeat(RawBlock::new(1, 0, 0)).take(200));
    blocks.extend(std::iter::repeat(RawBlock::new(2, 0, 0)).take(8));
    blocks.push(RawBlock::new(3, 0, 15));
    blocks.extend(std::iter::repeat(RawBlock::new(4, 0, 15)).take(111));
    blocks
}

fn filled_source(pool: &EntryPool) -> FullDataSource {
    let mut source = FullDataSource::new(SectionPos::new(0, 3, -7));
    for material in ["bedrock", "stone", "dirt", "grass_block", "air"] {
        source
            .dictionary()
            .add_if_not_present_and_get_id(pool.intern("plains", material));
    }
    for x in 0..SECTION_WIDTH {
        for z in 0..SECTION_WIDTH {
            let height = 60 + ((x * 7 + z * 3) % 40) as i32;
            let points = vec![
                data_point::encode(3, 1, height, 0, 15).unwrap(),
                data_point::encode(1, height - 1, 1, 0, 0).unwrap(),
                data_point::encode(0, 1, 0, 0, 0).unwrap(),
            ];
            source.set_column(x, z, points).unwrap();
        }
    }
    source
}

fn bench_build_column(c: &mut Criterion) {
    let blocks = layered_column();
    let view = ColumnView::new(&blocks);

    c.bench_function("build_column_merged", |b| {
        b.iter(|| build_column(black_box(&view), CompressionMode::MergeSameBlocks, &AlwaysVisible))
    });

    let enclosed = SkipEnclosed::new([4]);
    let neighbors = [Some(blocks.as_slice()); 4];
    let view = ColumnView::with_neighbors(&blocks, neighbors);
    c.bench_function("build_column_skip_enclosed", |b| {
        b.iter(|| build_column(black_box(&view), CompressionMode::MergeSameBlocks, &enclosed))
    });
}

fn bench_codec(c: &mut Criterion) {
    let pool = EntryPool::new();
    let source = filled_source(&pool);

    c.bench_function("serialize_data_source", |b| {
        b.iter(|| serialize_data_source(black_box(&source)))
    });

    let compressed = compress_data_source(&source).unwrap();
    c.bench_function("decompress_data_source", |b| {
        b.iter(|| decompress_data_source(source.pos(), black_box(&compressed), &pool))
    });
}

fn bench_detail_curve(c: &mut Criterion) {
    let curve = DetailCurve::default();
    c.bench_function("detail_level_for_distance", |b| {
        let mut d = 0.0f64;
        b.iter(|| {
            d = (d + 17.0) % 100_000.0;
            curve.detail_level_for_distance(black_box(d))
        })
    });
}

struct FlatLevel;

impl LevelContext for FlatLevel {
    fn min_y(&self) -> i32 {
        -64
    }

    fn max_y(&self) -> i32 {
        320
    }

    fn has_sky_light(&self) -> bool {
        true
    }

    fn compute_base_color(&self, _pos: SectionPos, _entry: &DictionaryEntry) -> u32 {
        0xff7f7f7f
    }
}

struct EmptyWorld;

impl DataSourceProvider for EmptyWorld {
    fn get(&self, pos: SectionPos) -> BoxFuture<'static, Result<Arc<FullDataSource>>> {
        Box::pin(async move { Ok(Arc::new(FullDataSource::new(pos))) })
    }

    fn can_queue_retrieval(&self) -> bool {
        false
    }

    fn queue_position_for_retrieval(&self, _pos: SectionPos) -> bool {
        false
    }

    fn positions_to_retrieve(&self, _pos: SectionPos) -> Vec<SectionPos> {
        Vec::new()
    }

    fn remove_retrieval_request_if(&self, _predicate: &dyn Fn(SectionPos) -> bool) {}
}

struct NullBuffer;

impl RenderBuffer for NullBuffer {
    fn is_empty(&self) -> bool {
        true
    }

    fn release(&mut self) {}
}

struct NullBuilder;

impl BufferBuilder for NullBuilder {
    fn build_and_upload_buffer(
        &self,
        _source: Arc<FullDataSource>,
        _neighbors: [Option<Arc<FullDataSource>>; 4],
    ) -> BoxFuture<'static, Result<Box<dyn RenderBuffer>>> {
        Box::pin(async { Ok(Box::new(NullBuffer) as Box<dyn RenderBuffer>) })
    }
}

fn bench_quadtree_tick(c: &mut Criterion) {
    let cache = LodCache::init(
        LodCacheConfig::default(),
        Arc::new(FlatLevel),
        Arc::new(NullBuilder),
        |_, _| Arc::new(EmptyWorld),
    )
    .unwrap();

    // Let the first wave of loads finish
    for _ in 0..50 {
        cache.tick(DVec2::ZERO).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    c.bench_function("quadtree_tick_moving_viewer", |b| {
        let mut frame = 0u32;
        b.iter(|| {
            frame += 1;
            let viewer = DVec2::new((frame as f64 * 0.05).sin() * 300.0, frame as f64 * 0.5 % 2048.0);
            cache.tick(black_box(viewer))
        })
    });

    cache.shutdown();
}

criterion_group!(
    benches,
    bench_build_column,
    bench_codec,
    bench_detail_curve,
    bench_quadtree_tick,
);
criterion_main!(benches);
