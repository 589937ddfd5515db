use bevy::camera::ScalingMode;
use bevy::image::ImagePlugin;
use bevy::input::touch::Touches;
use bevy::log::{debug, info, warn};
use bevy::render::settings::{Backends, PowerPreference, WgpuSettings};
use bevy::render::RenderPlugin;
use bevy::window::PrimaryWindow;
use bevy::prelude::*;

use std::collections::HashSet;
use thiserror::Error;

const VIEW_WIDTH: f32 = 800.0;
const VIEW_HEIGHT: f32 = 600.0;

const UNITS_PER_METER: f32 = 150.0;
const GRAVITY_Y: f32 = -9.8 * UNITS_PER_METER;

const TILE_SIZE: f32 = 64.0;
const TILE_KIND_COUNT: u32 = 3;
const TILE_BAND_Y_OFFSET: f32 = 120.0;

const RUN_SPEED: f32 = 180.0;
const IDLE_DAMPING: f32 = 0.9;
const JUMP_IMPULSE: f32 = 420.0;
const JUMP_MAX_VERTICAL_SPEED: f32 = 10.0;
const SWIPE_JUMP_THRESHOLD: f32 = 40.0;

const PATROL_DISTANCE: f32 = 120.0;
const PATROL_LEG_SECONDS: f32 = 1.2;
const PATROL_SPEED: f32 = PATROL_DISTANCE / PATROL_LEG_SECONDS;

const BOSS_HIT_POINTS: u32 = 10;
const BOSS_ATTACK_SECONDS: f32 = 2.0;
const PROJECTILE_VELOCITY: Vec2 = Vec2::new(-200.0, 50.0);
const PROJECTILE_LIFETIME_SECONDS: f32 = 6.0;

const STOMP_SPEED: f32 = -50.0;
const STOMP_BOUNCE_IMPULSE: f32 = 180.0;

const CAMERA_LEAD: f32 = 100.0;
const PARALLAX_FAR: f32 = 0.3;
const PARALLAX_NEAR: f32 = 0.6;

const PLAYER_SIZE: Vec2 = Vec2::new(48.0, 48.0);
const ENEMY_SIZE: Vec2 = Vec2::new(48.0, 48.0);
const BOSS_SIZE: Vec2 = Vec2::new(140.0, 140.0);
const PROJECTILE_SIZE: Vec2 = Vec2::new(20.0, 20.0);
const COIN_SIZE: Vec2 = Vec2::new(24.0, 24.0);
const GROUND_SIZE: Vec2 = Vec2::new(5000.0, 80.0);
const BACKGROUND_SIZE: Vec2 = Vec2::new(1024.0, 600.0);

const Z_BG_FAR: f32 = -10.0;
const Z_BG_NEAR: f32 = -9.0;
const Z_TILES: f32 = 0.0;
const Z_GROUND: f32 = 5.0;
const Z_ENEMY: f32 = 8.0;
const Z_BOSS: f32 = 9.0;
const Z_PROJECTILE: f32 = 9.0;
const Z_PLAYER: f32 = 10.0;
const Z_LABEL: f32 = 30.0;

#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, Debug, States)]
enum GameState {
    #[default]
    Playing,
    GameOver,
}

#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
struct PlayingSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RenderMode {
    Cpu,
    Gpu,
}

impl RenderMode {
    fn is_cpu(self) -> bool {
        matches!(self, RenderMode::Cpu)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RenderBackend {
    Auto,
    Gl,
    Vulkan,
}

impl RenderBackend {
    fn backends(self) -> Option<Backends> {
        match self {
            RenderBackend::Auto => None,
            RenderBackend::Gl => Some(Backends::GL),
            RenderBackend::Vulkan => Some(Backends::VULKAN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    None,
    Player,
    Ground,
    Enemy,
    Coin,
    Powerup,
}

impl Tag {
    const fn bit(self) -> u32 {
        match self {
            Tag::None => 0,
            Tag::Player => 1 << 0,
            Tag::Ground => 1 << 1,
            Tag::Enemy => 1 << 2,
            Tag::Coin => 1 << 3,
            Tag::Powerup => 1 << 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TagMask(u32);

impl TagMask {
    const NONE: TagMask = TagMask(0);

    const fn contains(self, tag: Tag) -> bool {
        self.0 & tag.bit() != 0
    }
}

impl From<Tag> for TagMask {
    fn from(tag: Tag) -> Self {
        TagMask(tag.bit())
    }
}

impl std::ops::BitOr for Tag {
    type Output = TagMask;

    fn bitor(self, rhs: Tag) -> TagMask {
        TagMask(self.bit() | rhs.bit())
    }
}

impl std::ops::BitOr<Tag> for TagMask {
    type Output = TagMask;

    fn bitor(self, rhs: Tag) -> TagMask {
        TagMask(self.0 | rhs.bit())
    }
}

// A collision volume. Dynamic actors additionally carry a Velocity; bodies
// without one never move.
#[derive(Component, Clone, Copy)]
struct Body {
    size: Vec2,
    category: Tag,
    contact_test: TagMask,
    collision: TagMask,
    restitution: f32,
}

#[derive(Component, Deref, DerefMut)]
struct Velocity(Vec2);

#[derive(Component)]
struct Player;

#[derive(Component)]
struct Patrol {
    direction: f32,
    leg_elapsed: f32,
}

impl Patrol {
    fn new() -> Self {
        Self {
            direction: 1.0,
            leg_elapsed: 0.0,
        }
    }

    // Advances the back-and-forth cycle and returns this tick's horizontal
    // travel. Legs are consumed exactly, so a large dt can span several.
    fn step(&mut self, dt: f32) -> f32 {
        let mut remaining = dt;
        let mut travel = 0.0;
        while remaining > 0.0 {
            let left_in_leg = PATROL_LEG_SECONDS - self.leg_elapsed;
            let step = remaining.min(left_in_leg);
            travel += self.direction * PATROL_SPEED * step;
            self.leg_elapsed += step;
            remaining -= step;
            if self.leg_elapsed >= PATROL_LEG_SECONDS {
                self.leg_elapsed = 0.0;
                self.direction = -self.direction;
            }
        }
        travel
    }
}

#[derive(Component)]
struct Boss {
    hit_points: u32,
    attack_timer: Timer,
}

#[derive(Component)]
struct Projectile {
    lifetime: Timer,
}

#[derive(Component)]
struct BackgroundLayer {
    factor: f32,
}

#[derive(Component)]
struct GameCamera;

#[derive(Component)]
struct ScoreLabel;

#[derive(Resource, Default)]
struct MovementIntent {
    move_left: bool,
    move_right: bool,
}

#[derive(Resource, Default)]
struct Score(u32);

#[derive(Resource, Default)]
struct ActiveContacts(HashSet<(Entity, Entity)>);

#[derive(Resource)]
struct LevelSource {
    path: String,
}

#[derive(Resource)]
struct GameAssets {
    player: Handle<Image>,
    enemy: Handle<Image>,
    coin: Handle<Image>,
    bg_far: Handle<Image>,
    bg_near: Handle<Image>,
    tiles: Handle<Image>,
    tiles_layout: Handle<TextureAtlasLayout>,
}

#[derive(Message)]
struct ContactStarted {
    a: Entity,
    b: Entity,
}

#[derive(Message)]
struct JumpAttempt;

#[derive(Debug, Error)]
enum LevelError {
    #[error("could not read level grid: {0}")]
    Io(#[from] std::io::Error),
    #[error("level grid is empty")]
    Empty,
}

// Text rows are stored top first; cells[0] is the topmost world row.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LevelGrid {
    columns: usize,
    cells: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileCell {
    column: usize,
    world_row: usize,
    tile_index: usize,
}

impl LevelGrid {
    fn parse(text: &str) -> Result<Self, LevelError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(LevelError::Empty);
        }

        let mut columns = 0;
        let mut cells = Vec::new();
        for (index, line) in trimmed.lines().enumerate() {
            let mut row: Vec<u32> = line
                .split(',')
                .map(|cell| cell.trim().parse::<u32>().unwrap_or(0))
                .collect();
            if index == 0 {
                columns = row.len();
            }
            row.resize(columns, 0);
            cells.push(row);
        }

        Ok(LevelGrid { columns, cells })
    }

    fn row_count(&self) -> usize {
        self.cells.len()
    }

    fn occupied_cells(&self) -> impl Iterator<Item = TileCell> + '_ {
        let rows = self.cells.len();
        self.cells.iter().enumerate().flat_map(move |(text_row, row)| {
            row.iter().enumerate().filter_map(move |(column, &value)| {
                if value == 0 || value > TILE_KIND_COUNT {
                    return None;
                }
                Some(TileCell {
                    column,
                    world_row: rows - 1 - text_row,
                    tile_index: (value - 1) as usize,
                })
            })
        })
    }
}

fn load_level_grid(path: &str) -> Result<LevelGrid, LevelError> {
    LevelGrid::parse(&std::fs::read_to_string(path)?)
}

fn tile_center(cell: TileCell) -> Vec2 {
    Vec2::new(
        cell.column as f32 * TILE_SIZE + TILE_SIZE * 0.5,
        cell.world_row as f32 * TILE_SIZE + TILE_SIZE * 0.5 + TILE_BAND_Y_OFFSET,
    )
}

fn main() {
    let render_mode = render_mode_from_args();
    let render_backend = render_backend_from_args();
    let level_path = level_path_from_args();

    let render_plugin = if render_mode.is_cpu() || render_backend != RenderBackend::Auto {
        RenderPlugin {
            render_creation: WgpuSettings {
                power_preference: if render_mode.is_cpu() {
                    PowerPreference::LowPower
                } else {
                    PowerPreference::HighPerformance
                },
                force_fallback_adapter: render_mode.is_cpu(),
                backends: render_backend.backends(),
                ..default()
            }
            .into(),
            ..default()
        }
    } else {
        RenderPlugin::default()
    };

    App::new()
        .add_plugins(
            DefaultPlugins
                .set(render_plugin)
                .set(ImagePlugin::default_nearest())
                .set(WindowPlugin {
                    primary_window: Some(Window {
                        title: "Coinfall".to_string(),
                        resolution: (1280, 720).into(),
                        resizable: true,
                        ..default()
                    }),
                    ..default()
                }),
        )
        .insert_resource(LevelSource { path: level_path })
        .init_state::<GameState>()
        .init_resource::<MovementIntent>()
        .init_resource::<Score>()
        .init_resource::<ActiveContacts>()
        .add_message::<ContactStarted>()
        .add_message::<JumpAttempt>()
        .add_systems(Startup, (setup, spawn_world).chain())
        .configure_sets(Update, PlayingSet.run_if(in_state(GameState::Playing)))
        .add_systems(
            Update,
            (
                touch_input_system,
                keyboard_input_system,
                player_drive_system,
                player_jump_system,
                patrol_system,
                boss_attack_system,
                projectile_lifetime_system,
                physics_system,
                contact_detection_system,
                contact_resolution_system,
                camera_follow_system,
                parallax_system,
                score_hud_system,
            )
                .chain()
                .in_set(PlayingSet),
        )
        .run();
}

fn setup(
    mut commands: Commands,
    asset_server: Res<AssetServer>,
    mut atlas_layouts: ResMut<Assets<TextureAtlasLayout>>,
) {
    commands.spawn((
        Camera2d,
        Projection::Orthographic(OrthographicProjection {
            scaling_mode: ScalingMode::Fixed {
                width: VIEW_WIDTH,
                height: VIEW_HEIGHT,
            },
            ..OrthographicProjection::default_2d()
        }),
        Transform::from_xyz(VIEW_WIDTH * 0.5, VIEW_HEIGHT * 0.5, 100.0),
        GameCamera,
    ));

    let tiles_layout = atlas_layouts.add(TextureAtlasLayout::from_grid(
        UVec2::new(TILE_SIZE as u32, TILE_SIZE as u32),
        TILE_KIND_COUNT,
        1,
        None,
        None,
    ));

    commands.insert_resource(GameAssets {
        player: asset_server.load("player.png"),
        enemy: asset_server.load("enemy.png"),
        coin: asset_server.load("coin.png"),
        bg_far: asset_server.load("bg_layer1.png"),
        bg_near: asset_server.load("bg_layer2.png"),
        tiles: asset_server.load("tiles.png"),
        tiles_layout,
    });
}

fn spawn_world(mut commands: Commands, assets: Res<GameAssets>, level: Res<LevelSource>) {
    spawn_parallax_background(&mut commands, &assets);
    spawn_player(&mut commands, &assets);
    spawn_ground(&mut commands);

    match load_level_grid(&level.path) {
        Ok(grid) => build_level_tiles(&mut commands, &assets, &grid),
        Err(err) => warn!("level grid unavailable ({err}); continuing with an empty level"),
    }

    spawn_actors_demo(&mut commands, &assets);
    spawn_score_hud(&mut commands);
}

fn spawn_parallax_background(commands: &mut Commands, assets: &GameAssets) {
    for (image, factor, z, name) in [
        (assets.bg_far.clone(), PARALLAX_FAR, Z_BG_FAR, "bg1"),
        (assets.bg_near.clone(), PARALLAX_NEAR, Z_BG_NEAR, "bg2"),
    ] {
        commands.spawn((
            Sprite {
                image,
                custom_size: Some(BACKGROUND_SIZE),
                ..default()
            },
            Transform::from_xyz(BACKGROUND_SIZE.x * 0.5, BACKGROUND_SIZE.y * 0.5, z),
            BackgroundLayer { factor },
            Name::new(name),
        ));
    }
}

fn spawn_player(commands: &mut Commands, assets: &GameAssets) {
    let mut sprite = Sprite::from_image(assets.player.clone());
    sprite.custom_size = Some(PLAYER_SIZE);

    commands.spawn((
        sprite,
        Transform::from_xyz(100.0, 300.0, Z_PLAYER),
        Body {
            size: PLAYER_SIZE,
            category: Tag::Player,
            contact_test: Tag::Enemy | Tag::Coin | Tag::Powerup,
            collision: Tag::Ground | Tag::Enemy,
            restitution: 0.0,
        },
        Velocity(Vec2::ZERO),
        Player,
        Name::new("player"),
    ));
}

// A wide slab under everything, so the player has footing even when the
// level grid fails to load.
fn spawn_ground(commands: &mut Commands) {
    commands.spawn((
        Sprite::from_color(Color::srgb(0.55, 0.35, 0.2), GROUND_SIZE),
        Transform::from_xyz(2500.0, 40.0, Z_GROUND),
        Body {
            size: GROUND_SIZE,
            category: Tag::Ground,
            contact_test: TagMask::NONE,
            collision: TagMask::NONE,
            restitution: 0.0,
        },
        Name::new("ground"),
    ));
}

fn build_level_tiles(commands: &mut Commands, assets: &GameAssets, grid: &LevelGrid) {
    let mut volumes = 0;
    for cell in grid.occupied_cells() {
        let center = tile_center(cell);

        let mut sprite = Sprite::from_atlas_image(
            assets.tiles.clone(),
            TextureAtlas {
                layout: assets.tiles_layout.clone(),
                index: cell.tile_index,
            },
        );
        sprite.custom_size = Some(Vec2::splat(TILE_SIZE));
        commands.spawn((
            sprite,
            Transform::from_xyz(center.x, center.y, Z_TILES),
            Name::new("tile"),
        ));

        commands.spawn((
            Transform::from_xyz(center.x, center.y, Z_TILES),
            Body {
                size: Vec2::splat(TILE_SIZE),
                category: Tag::Ground,
                contact_test: TagMask::NONE,
                collision: TagMask::NONE,
                restitution: 0.0,
            },
            Name::new("tile_collider"),
        ));
        volumes += 1;
    }
    info!(
        "level grid: {} columns x {} rows, {volumes} collision volumes",
        grid.columns,
        grid.row_count()
    );
}

fn spawn_actors_demo(commands: &mut Commands, assets: &GameAssets) {
    spawn_enemy(commands, assets, Vec2::new(600.0, 200.0));
    spawn_enemy(commands, assets, Vec2::new(1000.0, 200.0));
    spawn_boss(commands, Vec2::new(1400.0, 300.0));
    spawn_coin(commands, assets, Vec2::new(350.0, 260.0));
    spawn_coin(commands, assets, Vec2::new(420.0, 260.0));
    spawn_coin(commands, assets, Vec2::new(490.0, 260.0));
}

fn spawn_enemy(commands: &mut Commands, assets: &GameAssets, at: Vec2) {
    let mut sprite = Sprite::from_image(assets.enemy.clone());
    sprite.custom_size = Some(ENEMY_SIZE);

    commands.spawn((
        sprite,
        Transform::from_xyz(at.x, at.y, Z_ENEMY),
        Body {
            size: ENEMY_SIZE,
            category: Tag::Enemy,
            contact_test: Tag::Player.into(),
            collision: Tag::Ground | Tag::Player,
            restitution: 0.0,
        },
        Velocity(Vec2::ZERO),
        Patrol::new(),
        Name::new("enemy"),
    ));
}

fn spawn_boss(commands: &mut Commands, at: Vec2) {
    let boss = Boss {
        hit_points: BOSS_HIT_POINTS,
        attack_timer: Timer::from_seconds(BOSS_ATTACK_SECONDS, TimerMode::Repeating),
    };
    info!("boss spawned with {} hit points", boss.hit_points);

    commands.spawn((
        Sprite::from_color(Color::srgb(0.5, 0.2, 0.6), BOSS_SIZE),
        Transform::from_xyz(at.x, at.y, Z_BOSS),
        Body {
            size: BOSS_SIZE,
            category: Tag::Enemy,
            contact_test: Tag::Player.into(),
            collision: Tag::Ground | Tag::Player,
            restitution: 0.0,
        },
        Velocity(Vec2::ZERO),
        boss,
        Name::new("boss"),
    ));
}

fn spawn_coin(commands: &mut Commands, assets: &GameAssets, at: Vec2) {
    let mut sprite = Sprite::from_image(assets.coin.clone());
    sprite.custom_size = Some(COIN_SIZE);

    commands.spawn((
        sprite,
        Transform::from_xyz(at.x, at.y, Z_TILES),
        Body {
            size: COIN_SIZE,
            category: Tag::Coin,
            contact_test: Tag::Player.into(),
            collision: TagMask::NONE,
            restitution: 0.0,
        },
        Name::new("coin"),
    ));
}

fn spawn_projectile(commands: &mut Commands, at: Vec2) {
    commands.spawn((
        Sprite::from_color(Color::BLACK, PROJECTILE_SIZE),
        Transform::from_xyz(at.x, at.y, Z_PROJECTILE),
        Body {
            size: PROJECTILE_SIZE,
            category: Tag::Enemy,
            contact_test: Tag::Player.into(),
            collision: Tag::Ground.into(),
            restitution: 0.0,
        },
        Velocity(PROJECTILE_VELOCITY),
        Projectile {
            lifetime: Timer::from_seconds(PROJECTILE_LIFETIME_SECONDS, TimerMode::Once),
        },
        Name::new("projectile"),
    ));
}

fn spawn_score_hud(commands: &mut Commands) {
    commands.spawn((
        Node {
            position_type: PositionType::Absolute,
            left: px(8.0),
            top: px(8.0),
            ..default()
        },
        children![(
            Text::new("Score: 0"),
            TextFont {
                font_size: 18.0,
                ..default()
            },
            TextColor(Color::srgba(0.95, 0.92, 0.85, 1.0)),
            ScoreLabel,
        )],
    ));
}

fn touch_input_system(
    touches: Res<Touches>,
    windows: Query<&Window, With<PrimaryWindow>>,
    mut intent: ResMut<MovementIntent>,
    mut jumps: MessageWriter<JumpAttempt>,
) {
    let Ok(window) = windows.single() else {
        return;
    };

    for touch in touches.iter_just_pressed() {
        if touch_selects_left(touch.position().x, window.width()) {
            intent.move_left = true;
        } else {
            intent.move_right = true;
        }
    }

    // Any finger lifting cancels motion, whichever finger started it.
    if touches.iter_just_released().next().is_some()
        || touches.iter_just_canceled().next().is_some()
    {
        intent.move_left = false;
        intent.move_right = false;
    }

    for touch in touches.iter() {
        if is_upward_swipe(touch.previous_position(), touch.position()) {
            jumps.write(JumpAttempt);
        }
    }
}

fn keyboard_input_system(
    keys: Res<ButtonInput<KeyCode>>,
    mut intent: ResMut<MovementIntent>,
    mut jumps: MessageWriter<JumpAttempt>,
) {
    if keys.any_just_pressed([KeyCode::ArrowLeft, KeyCode::KeyA]) {
        intent.move_left = true;
    }
    if keys.any_just_pressed([KeyCode::ArrowRight, KeyCode::KeyD]) {
        intent.move_right = true;
    }
    if keys.any_just_released([
        KeyCode::ArrowLeft,
        KeyCode::KeyA,
        KeyCode::ArrowRight,
        KeyCode::KeyD,
    ]) {
        intent.move_left = false;
        intent.move_right = false;
    }
    if keys.any_just_pressed([KeyCode::Space, KeyCode::ArrowUp, KeyCode::KeyW]) {
        jumps.write(JumpAttempt);
    }
}

fn player_drive_system(
    intent: Res<MovementIntent>,
    mut players: Query<&mut Velocity, With<Player>>,
) {
    let Ok(mut velocity) = players.single_mut() else {
        return;
    };
    velocity.x = drive_horizontal(&intent, velocity.x);
}

fn player_jump_system(
    mut jumps: MessageReader<JumpAttempt>,
    mut players: Query<&mut Velocity, With<Player>>,
) {
    let Ok(mut velocity) = players.single_mut() else {
        return;
    };
    for _ in jumps.read() {
        if velocity.y.abs() < JUMP_MAX_VERTICAL_SPEED {
            apply_impulse(&mut velocity, Vec2::new(0.0, JUMP_IMPULSE));
        }
    }
}

fn patrol_system(time: Res<Time>, mut patrols: Query<(&mut Transform, &mut Patrol)>) {
    let dt = time.delta_secs();
    for (mut transform, mut patrol) in patrols.iter_mut() {
        transform.translation.x += patrol.step(dt);
    }
}

fn boss_attack_system(
    time: Res<Time>,
    mut commands: Commands,
    mut bosses: Query<(&Transform, &mut Boss)>,
) {
    for (transform, mut boss) in bosses.iter_mut() {
        boss.attack_timer.tick(time.delta());
        for _ in 0..boss.attack_timer.times_finished_this_tick() {
            spawn_projectile(&mut commands, transform.translation.truncate());
        }
    }
}

fn projectile_lifetime_system(
    time: Res<Time>,
    mut commands: Commands,
    mut projectiles: Query<(Entity, &mut Projectile)>,
) {
    for (entity, mut projectile) in projectiles.iter_mut() {
        projectile.lifetime.tick(time.delta());
        if projectile.lifetime.is_finished() {
            commands.entity(entity).despawn();
        }
    }
}

#[derive(Clone, Copy)]
struct Obstacle {
    entity: Entity,
    position: Vec2,
    size: Vec2,
    category: Tag,
}

fn physics_system(
    time: Res<Time>,
    mut bodies: ParamSet<(
        Query<(Entity, &Transform, &Body)>,
        Query<(Entity, &mut Transform, &mut Velocity, &Body)>,
    )>,
) {
    let dt = time.delta_secs();

    let obstacles: Vec<Obstacle> = bodies
        .p0()
        .iter()
        .map(|(entity, transform, body)| Obstacle {
            entity,
            position: transform.translation.truncate(),
            size: body.size,
            category: body.category,
        })
        .collect();

    for (entity, mut transform, mut velocity, body) in bodies.p1().iter_mut() {
        velocity.y += GRAVITY_Y * dt;

        let blockers: Vec<Obstacle> = obstacles
            .iter()
            .filter(|obstacle| {
                obstacle.entity != entity && body.collision.contains(obstacle.category)
            })
            .copied()
            .collect();

        let mut position = transform.translation.truncate();
        let delta = **velocity * dt;
        let (hit_x, hit_y) = move_against(&mut position, delta, body.size, &blockers);
        if hit_x {
            velocity.x = -velocity.x * body.restitution;
        }
        if hit_y {
            velocity.y = -velocity.y * body.restitution;
        }

        transform.translation.x = position.x;
        transform.translation.y = position.y;
    }
}

fn contact_detection_system(
    bodies: Query<(Entity, &Transform, &Body)>,
    mut active: ResMut<ActiveContacts>,
    mut contacts: MessageWriter<ContactStarted>,
) {
    let snapshot: Vec<(Entity, Vec2, &Body)> = bodies
        .iter()
        .map(|(entity, transform, body)| (entity, transform.translation.truncate(), body))
        .collect();

    let mut current = HashSet::new();
    for (index, &(a, a_pos, a_body)) in snapshot.iter().enumerate() {
        for &(b, b_pos, b_body) in &snapshot[index + 1..] {
            if !wants_contact(a_body, b_body) {
                continue;
            }
            if !aabb_intersects(a_pos, a_body.size, b_pos, b_body.size) {
                continue;
            }
            let pair = ordered_pair(a, b);
            current.insert(pair);
            if !active.0.contains(&pair) {
                contacts.write(ContactStarted {
                    a: pair.0,
                    b: pair.1,
                });
            }
        }
    }
    active.0 = current;
}

fn contact_resolution_system(
    mut contacts: MessageReader<ContactStarted>,
    mut commands: Commands,
    mut score: ResMut<Score>,
    mut next_state: ResMut<NextState<GameState>>,
    participants: Query<(&Body, Option<&Name>)>,
    mut players: Query<(Entity, &Transform, &mut Velocity), With<Player>>,
) {
    let name_of = |entity: Entity| {
        participants
            .get(entity)
            .ok()
            .and_then(|(_, name)| name)
            .map(Name::as_str)
    };
    let category_of = |entity: Entity| {
        participants
            .get(entity)
            .map_or(Tag::None, |(body, _)| body.category)
    };

    for contact in contacts.read() {
        // A coin pickup wins over any other classification of the same
        // contact, but only when both participants are named.
        if let (Some(first), Some(second)) = (name_of(contact.a), name_of(contact.b)) {
            if first == "coin" || second == "coin" {
                let coin = if first == "coin" { contact.a } else { contact.b };
                commands.entity(coin).despawn();
                score.0 += 1;
                debug!("coin collected, score {}", score.0);
                continue;
            }
        }

        let enemy = match (category_of(contact.a), category_of(contact.b)) {
            (Tag::Player, Tag::Enemy) => contact.b,
            (Tag::Enemy, Tag::Player) => contact.a,
            _ => continue,
        };
        let Ok((player_entity, player_transform, mut velocity)) = players.single_mut() else {
            continue;
        };

        if velocity.y < STOMP_SPEED {
            commands.entity(enemy).despawn();
            apply_impulse(&mut velocity, Vec2::new(0.0, STOMP_BOUNCE_IMPULSE));
        } else {
            game_over(
                &mut commands,
                player_entity,
                player_transform.translation.truncate(),
                &mut next_state,
            );
            break;
        }
    }
}

fn game_over(
    commands: &mut Commands,
    player_entity: Entity,
    player_position: Vec2,
    next_state: &mut NextState<GameState>,
) {
    info!("game over");
    commands.spawn((
        Text2d::new("Game Over"),
        TextFont {
            font_size: 48.0,
            ..default()
        },
        TextColor(Color::WHITE),
        TextLayout::new_with_justify(Justify::Center),
        Transform::from_xyz(player_position.x + CAMERA_LEAD, VIEW_HEIGHT * 0.5, Z_LABEL),
    ));
    commands.entity(player_entity).despawn();
    next_state.set(GameState::GameOver);
}

fn camera_follow_system(
    players: Query<&Transform, With<Player>>,
    mut cameras: Query<&mut Transform, (With<GameCamera>, Without<Player>)>,
) {
    let Ok(player_transform) = players.single() else {
        return;
    };
    let Ok(mut camera_transform) = cameras.single_mut() else {
        return;
    };

    camera_transform.translation.x = player_transform.translation.x + CAMERA_LEAD;
    camera_transform.translation.y = VIEW_HEIGHT * 0.5;
}

fn parallax_system(
    cameras: Query<&Transform, With<GameCamera>>,
    mut layers: Query<(&mut Transform, &BackgroundLayer), Without<GameCamera>>,
) {
    let Ok(camera_transform) = cameras.single() else {
        return;
    };
    for (mut transform, layer) in layers.iter_mut() {
        transform.translation.x = parallax_x(camera_transform.translation.x, layer.factor);
    }
}

fn score_hud_system(score: Res<Score>, mut labels: Query<&mut Text, With<ScoreLabel>>) {
    if !score.is_changed() {
        return;
    }
    for mut text in labels.iter_mut() {
        text.0 = format!("Score: {}", score.0);
    }
}

// Unit-mass bodies: an impulse maps directly onto a velocity change.
fn apply_impulse(velocity: &mut Velocity, impulse: Vec2) {
    velocity.0 += impulse;
}

fn drive_horizontal(intent: &MovementIntent, current: f32) -> f32 {
    if intent.move_left {
        -RUN_SPEED
    } else if intent.move_right {
        RUN_SPEED
    } else {
        current * IDLE_DAMPING
    }
}

fn touch_selects_left(x: f32, window_width: f32) -> bool {
    x < window_width * 0.5
}

// Window coordinates grow downward, so an upward swipe shrinks y.
fn is_upward_swipe(previous: Vec2, current: Vec2) -> bool {
    previous.y - current.y > SWIPE_JUMP_THRESHOLD
}

fn parallax_x(camera_x: f32, factor: f32) -> f32 {
    camera_x * factor - VIEW_WIDTH * 0.5 + BACKGROUND_SIZE.x * 0.5
}

fn wants_contact(a: &Body, b: &Body) -> bool {
    a.contact_test.contains(b.category) || b.contact_test.contains(a.category)
}

fn ordered_pair(a: Entity, b: Entity) -> (Entity, Entity) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn aabb_intersects(pos_a: Vec2, size_a: Vec2, pos_b: Vec2, size_b: Vec2) -> bool {
    let half_a = size_a * 0.5;
    let half_b = size_b * 0.5;
    (pos_a.x - pos_b.x).abs() < (half_a.x + half_b.x)
        && (pos_a.y - pos_b.y).abs() < (half_a.y + half_b.y)
}

fn move_against(
    position: &mut Vec2,
    delta: Vec2,
    size: Vec2,
    obstacles: &[Obstacle],
) -> (bool, bool) {
    let half = size * 0.5;
    let mut hit_x = false;
    let mut hit_y = false;

    if delta.x != 0.0 {
        position.x += delta.x;
        for obstacle in obstacles {
            let other_half = obstacle.size * 0.5;
            if (position.y - obstacle.position.y).abs() >= half.y + other_half.y {
                continue;
            }
            if (position.x - obstacle.position.x).abs() >= half.x + other_half.x {
                continue;
            }
            hit_x = true;
            position.x = if delta.x > 0.0 {
                obstacle.position.x - other_half.x - half.x
            } else {
                obstacle.position.x + other_half.x + half.x
            };
        }
    }

    if delta.y != 0.0 {
        position.y += delta.y;
        for obstacle in obstacles {
            let other_half = obstacle.size * 0.5;
            if (position.x - obstacle.position.x).abs() >= half.x + other_half.x {
                continue;
            }
            if (position.y - obstacle.position.y).abs() >= half.y + other_half.y {
                continue;
            }
            hit_y = true;
            position.y = if delta.y > 0.0 {
                obstacle.position.y - other_half.y - half.y
            } else {
                obstacle.position.y + other_half.y + half.y
            };
        }
    }

    (hit_x, hit_y)
}

fn render_mode_from_args() -> RenderMode {
    let mut mode = RenderMode::Gpu;
    if let Ok(value) = std::env::var("COINFALL_RENDER_MODE") {
        match value.to_lowercase().as_str() {
            "gpu" | "hardware" => mode = RenderMode::Gpu,
            "cpu" | "software" => mode = RenderMode::Cpu,
            _ => {}
        }
    }

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--gpu" | "--render=gpu" => mode = RenderMode::Gpu,
            "--cpu" | "--render=cpu" => mode = RenderMode::Cpu,
            _ => {}
        }
    }

    mode
}

fn render_backend_from_args() -> RenderBackend {
    let mut backend = RenderBackend::Auto;
    if let Ok(value) = std::env::var("COINFALL_WGPU_BACKEND") {
        match value.to_lowercase().as_str() {
            "auto" => backend = RenderBackend::Auto,
            "gl" | "opengl" => backend = RenderBackend::Gl,
            "vk" | "vulkan" => backend = RenderBackend::Vulkan,
            _ => {}
        }
    }

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--backend=auto" => backend = RenderBackend::Auto,
            "--backend=gl" | "--backend=opengl" => backend = RenderBackend::Gl,
            "--backend=vk" | "--backend=vulkan" => backend = RenderBackend::Vulkan,
            _ => {}
        }
    }

    backend
}

fn level_path_from_args() -> String {
    let mut path = "assets/level1.csv".to_string();
    if let Ok(value) = std::env::var("COINFALL_LEVEL") {
        path = value;
    }

    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("--level=") {
            path = value.to_string();
        }
    }

    path
}
