use anyhow::Result;
use medgemma_core::inference::{FusedSequence, fuse_embeddings};

const EMBED_DIM: usize = 4;
const IMAGE_TOKEN: i64 = 90;

/// Embedding lookup stand-in: a row of `embed_dim` copies of the id.
fn lookup(id: i64) -> Result<Vec<f32>> {
    Ok(vec![id as f32; EMBED_DIM])
}

fn patch_block(rows: usize) -> Vec<f32> {
    (0..rows * EMBED_DIM).map(|i| 1000.0 + i as f32).collect()
}

#[test]
fn text_only_sequence_is_one_row_per_token() -> Result<()> {
    let tokens = [2i64, 5, 7, 11];
    let fused = fuse_embeddings(&tokens, IMAGE_TOKEN, None, EMBED_DIM, lookup)?;
    assert_eq!(fused.positions, 4);
    assert_eq!(fused.spliced_images, 0);
    assert_eq!(fused.embeds.len(), 4 * EMBED_DIM);
    assert_eq!(&fused.embeds[..EMBED_DIM], &[2.0; EMBED_DIM]);
    assert_eq!(&fused.embeds[3 * EMBED_DIM..], &[11.0; EMBED_DIM]);
    Ok(())
}

#[test]
fn placeholder_splices_all_patch_rows_in_place() -> Result<()> {
    let patches = patch_block(3);
    let tokens = [2i64, 5, IMAGE_TOKEN, 7];
    let fused = fuse_embeddings(&tokens, IMAGE_TOKEN, Some(&patches), EMBED_DIM, lookup)?;

    // placeholder count * patch_rows + ordinary count = fused length
    assert_eq!(fused.positions, 3 + 3);
    assert_eq!(fused.spliced_images, 1);
    let splice = &fused.embeds[2 * EMBED_DIM..5 * EMBED_DIM];
    assert_eq!(splice, patches.as_slice());
    assert_eq!(&fused.embeds[5 * EMBED_DIM..], &[7.0; EMBED_DIM]);
    Ok(())
}

#[test]
fn every_placeholder_occurrence_duplicates_the_patches() -> Result<()> {
    let patches = patch_block(2);
    let tokens = [2i64, IMAGE_TOKEN, 5, IMAGE_TOKEN];
    let fused = fuse_embeddings(&tokens, IMAGE_TOKEN, Some(&patches), EMBED_DIM, lookup)?;
    assert_eq!(fused.positions, 2 + 2 * 2);
    assert_eq!(fused.spliced_images, 2);
    assert_eq!(&fused.embeds[EMBED_DIM..3 * EMBED_DIM], patches.as_slice());
    assert_eq!(&fused.embeds[4 * EMBED_DIM..], patches.as_slice());
    Ok(())
}

#[test]
fn placeholder_without_patches_embeds_as_ordinary_token() -> Result<()> {
    let tokens = [2i64, IMAGE_TOKEN, 5];
    let fused = fuse_embeddings(&tokens, IMAGE_TOKEN, None, EMBED_DIM, lookup)?;
    assert_eq!(fused.positions, 3);
    assert_eq!(fused.spliced_images, 0);
    assert_eq!(
        &fused.embeds[EMBED_DIM..2 * EMBED_DIM],
        &[IMAGE_TOKEN as f32; EMBED_DIM]
    );
    Ok(())
}

#[test]
fn misaligned_patch_buffer_is_rejected() {
    let patches = vec![0.0f32; EMBED_DIM + 1];
    let err = fuse_embeddings(&[2i64], IMAGE_TOKEN, Some(&patches), EMBED_DIM, lookup)
        .expect_err("patch buffer not a multiple of embed_dim");
    assert!(err.to_string().contains("multiple of embed_dim"));
}

#[test]
fn wrong_width_embedding_row_is_rejected() {
    let short_row = |_id: i64| Ok(vec![0.0f32; EMBED_DIM - 1]);
    let err = fuse_embeddings(&[2i64], IMAGE_TOKEN, None, EMBED_DIM, short_row)
        .expect_err("row width mismatch");
    assert!(err.to_string().contains("embedding row"));
}

#[test]
fn lookup_is_never_called_for_spliced_placeholders() -> Result<()> {
    let patches = patch_block(1);
    let tokens = [IMAGE_TOKEN, 5];
    let mut looked_up = Vec::new();
    let FusedSequence { positions, .. } = fuse_embeddings(
        &tokens,
        IMAGE_TOKEN,
        Some(&patches),
        EMBED_DIM,
        |id| {
            looked_up.push(id);
            lookup(id)
        },
    )?;
    assert_eq!(positions, 2);
    assert_eq!(looked_up, vec![5]);
    Ok(())
}
