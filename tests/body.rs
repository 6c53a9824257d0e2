use lung::observer::BodyAdapter;
use lung::prelude::*;

fn body(seed: u64) -> Body {
    Body::new(BodyConfig {
        lung: LungConfig::with_dims(64, 16, 8, 4).with_seed(seed),
        dark_matter: DarkMatterConfig::default().with_seed(seed),
        gate: GateConfig::default(),
    })
    .unwrap()
}

#[test]
fn resonant_input_is_accepted() {
    let mut b = body(1);
    b.lung.fill_resonance(0.6);
    let inj = b.inject(&[10, 11, 12], FieldPulse::default());
    assert!(inj.accepted);
    assert_eq!(inj.scar_mass, 0.0);
    assert_eq!(b.dark_matter.len(), 0);
}

#[test]
fn dissonant_input_leaves_exactly_one_scar() {
    let mut b = body(1);
    b.lung.fill_resonance(0.2);
    let before = b.dark_matter.len();
    let inj = b.inject(&[10, 11, 12], FieldPulse::default());
    assert!(!inj.accepted);
    assert!(inj.scar_mass > 0.0);
    assert_eq!(b.dark_matter.len(), before + 1);

    // Mass follows (1 - rf)(1 + entropy/2); rf ≈ 0.2 here.
    let entropy = b.lung.last_entropy();
    let expected = (1.0 - inj.resonance_field) * (1.0 + 0.5 * entropy);
    assert!((inj.scar_mass - expected).abs() < 1e-5);
}

#[test]
fn scar_field_repels_and_fades() {
    let mut b = body(4);
    b.lung.fill_resonance(0.0);
    b.inject(&[33, 34], FieldPulse::default());
    let scar = b.dark_matter.scars().next().cloned().unwrap();

    let near = b.potential(scar.x + 0.1, scar.y);
    let far = b.potential(scar.x + 5.0, scar.y);
    assert!(near > far);

    let (gx, _) = b.gradient(scar.x + 1.0, scar.y);
    assert!(gx > 0.0);
    let (gx, _) = b.gradient(scar.x - 1.0, scar.y);
    assert!(gx < 0.0);

    let mut ticks = 0;
    while !b.dark_matter.is_empty() {
        b.tick();
        ticks += 1;
        assert!(ticks < 5000);
    }
    assert_eq!(b.potential(scar.x, scar.y), 0.0);
}

#[test]
fn same_tokens_scar_in_the_same_place() {
    let mut a = body(8);
    let mut b = body(8);
    a.lung.fill_resonance(0.0);
    b.lung.fill_resonance(0.0);
    a.inject(&[1, 2, 3], FieldPulse::default());
    b.inject(&[1, 2, 3], FieldPulse::default());
    let sa = a.dark_matter.scars().next().cloned().unwrap();
    let sb = b.dark_matter.scars().next().cloned().unwrap();
    assert_eq!((sa.x, sa.y), (sb.x, sb.y));
    assert_eq!(sa.mass, sb.mass);
}

#[test]
fn memory_is_bounded() {
    let mut b = body(2);
    for t in 0..100u32 {
        b.lung.fill_resonance(0.0);
        b.inject(&[t % 64, (t + 1) % 64], FieldPulse::default());
    }
    assert_eq!(b.dark_matter.len(), 64);
    let live: f32 = b.dark_matter.scars().map(|s| s.mass).sum();
    assert_eq!(b.dark_matter.total_mass(), live);
}

#[test]
fn image_round_trip_keeps_lung_and_memory() {
    let mut b = body(5);
    b.forward(&[1, 2, 3]);
    b.train_step(&[1, 2, 3], 4).unwrap();
    b.lung.fill_resonance(0.1);
    b.inject(&[7, 8, 9], FieldPulse::default());
    b.tick();

    let bytes = b.save_image_bytes().unwrap();
    let mut loaded = Body::load_image_bytes(&bytes, GateConfig::default()).unwrap();

    let before = BodyAdapter::new(&b).snapshot();
    let after = BodyAdapter::new(&loaded).snapshot();
    assert_eq!(before.scars, after.scars);
    assert_eq!(before.memory_ticks, after.memory_ticks);
    assert_eq!(before.lung.forward_count, after.lung.forward_count);
    assert_eq!(before.lung.train_steps, after.lung.train_steps);

    let x = b.forward(&[4, 5]).probabilities;
    let y = loaded.forward(&[4, 5]).probabilities;
    assert_eq!(x, y);
}

#[test]
fn lung_image_loads_as_body_with_empty_memory() {
    let lung = Lung::new(LungConfig::with_dims(16, 8, 4, 2).with_seed(3)).unwrap();
    let bytes = lung.save_image_bytes().unwrap();
    let body = Body::load_image_bytes(&bytes, GateConfig::default()).unwrap();
    assert!(body.dark_matter.is_empty());
    assert_eq!(body.lung.tensors().wo, lung.tensors().wo);
}
