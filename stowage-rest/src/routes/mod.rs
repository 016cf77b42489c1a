use actix_web::web::{self, ServiceConfig};

pub mod fs;

pub fn config(cfg: &mut ServiceConfig) {
    cfg.service(web::scope("/fs").configure(fs::config));
}
