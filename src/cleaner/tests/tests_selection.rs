use crate::cleaner::estimate_live;
use crate::log::entry::FileSummary;

fn summary(ln_count: u32, ln_size: u32, in_size: u32, obsolete: u32) -> FileSummary {
    FileSummary {
        total_count: ln_count + 1,
        total_size: ln_size + in_size,
        in_count: 1,
        in_size,
        ln_count,
        ln_size,
        reserved: 0,
        obsolete_ln_count: obsolete,
    }
}

#[test]
fn fresh_file_with_no_obsolescence_is_fully_live() {
    let s = summary(10, 1000, 500, 0);
    let (live, total) = estimate_live(&s, 0, 16);
    assert_eq!(total, 1500);
    assert_eq!(live, 1500);
}

#[test]
fn obsolete_leaf_bytes_scale_with_average_record_size() {
    // 10 leaf records totalling 1000 bytes, 4 of them obsolete.
    let s = summary(10, 1000, 0, 4);
    let (live, total) = estimate_live(&s, 0, 16);
    assert_eq!(total, 1000);
    assert_eq!(live, 600);
}

#[test]
fn internal_bytes_age_out_linearly() {
    let s = summary(0, 0, 800, 0);
    let (live_young, _) = estimate_live(&s, 4, 16);
    assert_eq!(live_young, 800 - 800 * 4 / 16);
    let (live_mid, _) = estimate_live(&s, 8, 16);
    assert_eq!(live_mid, 400);
}

#[test]
fn internal_bytes_beyond_the_age_threshold_are_fully_obsolete() {
    let s = summary(0, 0, 800, 0);
    let (live, total) = estimate_live(&s, 16, 16);
    assert_eq!(total, 800);
    assert_eq!(live, 0);
    let (live_older, _) = estimate_live(&s, 64, 16);
    assert_eq!(live_older, 0);
}

#[test]
fn obsolete_count_overshoot_cannot_underflow() {
    // More obsolete marks than leaf bytes (duplicated marks after a
    // migration burst): live clamps at zero.
    let s = summary(2, 100, 0, 50);
    let (live, _) = estimate_live(&s, 0, 16);
    assert_eq!(live, 0);
}
