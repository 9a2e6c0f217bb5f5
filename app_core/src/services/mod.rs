pub mod ai_creative;
pub mod pinterest;
pub mod shopify;
pub mod supabase;
